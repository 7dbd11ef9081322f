//! HX711 24-bit load-cell ADC, bit-banged over two GPIO lines.
//!
//! Channel A at gain 128: 24 data pulses MSB first, then one extra pulse to
//! select the gain for the next conversion. Holding SCK high for more than
//! 60 µs puts the chip to sleep. Conversions busy-wait on the data line, so
//! they run on the blocking pool.

use async_trait::async_trait;
use gpiod::{Chip, Input, Lines, Options, Output};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{AppResult, RigError};
use crate::hardware::{LinePin, MassSensorController};

const CONSUMER: &str = "capture-rig-hx711";
/// Pulses after the 24 data bits: 1 selects channel A, gain 128.
const GAIN_PULSES: u32 = 1;
const READY_TIMEOUT: Duration = Duration::from_millis(500);
const POWER_DOWN_HOLD: Duration = Duration::from_micros(100);

struct Bus {
    data: Lines<Input>,
    clock: Lines<Output>,
}

fn bus_error(e: std::io::Error) -> RigError {
    RigError::MassSensor(e.to_string())
}

impl Bus {
    fn set_clock(&self, high: bool) -> AppResult<()> {
        self.clock.set_values([high]).map_err(bus_error)
    }

    fn data_high(&self) -> AppResult<bool> {
        let [level] = self.data.get_values([false; 1]).map_err(bus_error)?;
        Ok(level)
    }

    fn wait_ready(&self) -> AppResult<()> {
        let start = Instant::now();
        while self.data_high()? {
            if start.elapsed() > READY_TIMEOUT {
                return Err(RigError::MassSensor("HX711 not ready (DOUT stuck high)".into()));
            }
            thread::sleep(Duration::from_micros(100));
        }
        Ok(())
    }

    /// One signed 24-bit conversion.
    fn read_raw(&self) -> AppResult<i32> {
        self.wait_ready()?;
        let mut value: u32 = 0;
        for _ in 0..24 {
            self.set_clock(true)?;
            self.set_clock(false)?;
            value = (value << 1) | u32::from(self.data_high()?);
        }
        for _ in 0..GAIN_PULSES {
            self.set_clock(true)?;
            self.set_clock(false)?;
        }
        Ok(sign_extend_24(value))
    }
}

/// Two's complement 24-bit → i32.
fn sign_extend_24(raw: u32) -> i32 {
    ((raw << 8) as i32) >> 8
}

/// HX711 bit-banged over two GPIO lines, channel A at gain 128.
pub struct Hx711 {
    bus: Option<Bus>,
    reference_unit: f64,
    powered: bool,
}

impl Hx711 {
    /// Requests `data` as input and `clock` as output on `chip`.
    pub fn open(chip: &str, data: LinePin, clock: LinePin) -> AppResult<Self> {
        let chip = Chip::new(chip)
            .map_err(|e| RigError::DeviceUnavailable(format!("GPIO chip {chip}: {e}")))?;
        let data_lines = chip
            .request_lines(Options::input([u32::from(data.line())]).consumer(CONSUMER))
            .map_err(|e| RigError::HardwareAssertion {
                line: data.line(),
                message: e.to_string(),
            })?;
        // Clock starts high: the chip stays asleep until power_up.
        let clock_lines = chip
            .request_lines(
                Options::output([u32::from(clock.line())])
                    .values([true])
                    .consumer(CONSUMER),
            )
            .map_err(|e| RigError::HardwareAssertion {
                line: clock.line(),
                message: e.to_string(),
            })?;
        debug!(%data, %clock, "HX711 lines claimed");
        Ok(Self {
            bus: Some(Bus {
                data: data_lines,
                clock: clock_lines,
            }),
            reference_unit: 1.0,
            powered: false,
        })
    }

    /// Runs `f` with the bus on the blocking pool.
    async fn with_bus<T, F>(&mut self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Bus) -> AppResult<T> + Send + 'static,
    {
        let bus = self
            .bus
            .take()
            .ok_or_else(|| RigError::MassSensor("HX711 bus lost".into()))?;
        let (bus, result) = tokio::task::spawn_blocking(move || {
            let result = f(&bus);
            (bus, result)
        })
        .await?;
        self.bus = Some(bus);
        result
    }
}

#[async_trait]
impl MassSensorController for Hx711 {
    async fn power_up(&mut self) -> AppResult<()> {
        self.with_bus(|bus| bus.set_clock(false)).await?;
        self.powered = true;
        Ok(())
    }

    async fn set_reference(&mut self, unit: f64) -> AppResult<()> {
        if unit == 0.0 || !unit.is_finite() {
            return Err(RigError::MassSensor(format!("invalid reference unit {unit}")));
        }
        self.reference_unit = unit;
        Ok(())
    }

    async fn sample(&mut self, count: usize) -> AppResult<f64> {
        if !self.powered {
            return Err(RigError::MassSensor("HX711 sampled while powered down".into()));
        }
        let count = count.max(1);
        let sum = self
            .with_bus(move |bus| {
                let mut sum = 0i64;
                for _ in 0..count {
                    sum += i64::from(bus.read_raw()?);
                }
                Ok(sum)
            })
            .await?;
        Ok(sum as f64 / count as f64 / self.reference_unit)
    }

    async fn power_down(&mut self) -> AppResult<()> {
        self.with_bus(|bus| {
            bus.set_clock(false)?;
            bus.set_clock(true)?;
            thread::sleep(POWER_DOWN_HOLD);
            Ok(())
        })
        .await?;
        self.powered = false;
        Ok(())
    }

    fn is_powered(&self) -> bool {
        self.powered
    }
}
