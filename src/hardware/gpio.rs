//! Digital output lines on a Linux GPIO character device.
//!
//! Each reserved line is its own single-line request, so a line stays claimed
//! (and invisible to other processes) from `reserve` until `release_all`.

use async_trait::async_trait;
use gpiod::{Chip, Lines, Options, Output};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::error::{AppResult, RigError};
use crate::hardware::{IlluminationController, LinePin};

const CONSUMER: &str = "capture-rig";

/// Lamp and LED lines on a GPIO character device.
pub struct GpioIllumination {
    chip: Chip,
    lines: BTreeMap<u8, Lines<Output>>,
}

impl GpioIllumination {
    /// Opens `chip`, e.g. `gpiochip0`.
    pub fn open(chip: &str) -> AppResult<Self> {
        let chip = Chip::new(chip)
            .map_err(|e| RigError::DeviceUnavailable(format!("GPIO chip {chip}: {e}")))?;
        info!(chip = %chip.name(), lines = chip.num_lines(), "GPIO chip opened");
        Ok(Self {
            chip,
            lines: BTreeMap::new(),
        })
    }

    fn drive(&mut self, line: LinePin, level: bool) -> AppResult<()> {
        let request = self
            .lines
            .get(&line.line())
            .ok_or_else(|| RigError::HardwareAssertion {
                line: line.line(),
                message: "line is not reserved".into(),
            })?;
        request
            .set_values([level])
            .map_err(|e| RigError::HardwareAssertion {
                line: line.line(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl IlluminationController for GpioIllumination {
    async fn reserve(&mut self, line: LinePin) -> AppResult<()> {
        if self.lines.contains_key(&line.line()) {
            return Err(RigError::HardwareAssertion {
                line: line.line(),
                message: "line already reserved".into(),
            });
        }
        let options = Options::output([u32::from(line.line())])
            .values([false])
            .consumer(CONSUMER);
        let request = self
            .chip
            .request_lines(options)
            .map_err(|e| RigError::HardwareAssertion {
                line: line.line(),
                message: format!("request failed: {e}"),
            })?;
        self.lines.insert(line.line(), request);
        info!(%line, "GPIO line reserved");
        Ok(())
    }

    async fn assert_high(&mut self, line: LinePin) -> AppResult<()> {
        self.drive(line, true)
    }

    async fn assert_low(&mut self, line: LinePin) -> AppResult<()> {
        self.drive(line, false)
    }

    async fn release_all(&mut self) -> AppResult<()> {
        let mut first_error = None;
        for (line, request) in std::mem::take(&mut self.lines) {
            if let Err(e) = request.set_values([false]) {
                warn!(line, error = %e, "Failed to drive line low on release");
                first_error.get_or_insert(RigError::HardwareAssertion {
                    line,
                    message: e.to_string(),
                });
            }
            // Dropping the request hands the line back to the kernel.
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
