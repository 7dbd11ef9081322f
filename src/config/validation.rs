//! Settings validation.
//!
//! [`validate`] turns the raw form values into an [`ExperimentConfig`] or
//! reports the first field that breaks its rule. Checks run in form order
//! (noise burst, illuminated burst, camera, timing, sweep, lamp, LEDs, scale),
//! so the reported field is always the earliest offending one.
//! [`validate_single`] checks only what a one-off burst needs. Nothing here
//! touches hardware or logs.

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::config::experiment::{
    BurstSettings, CameraSettings, CaptureKind, ExperimentConfig, LedSettings, ScaleSettings,
    ShutterSweep, SingleCapture,
};
use crate::config::settings::ExperimentSettings;
use crate::error::{AppResult, RigError};
use crate::hardware::pins::{self, PinSelection, EXTERNAL_SOURCE};
use crate::hardware::LinePin;

/// Single exposure, µs.
pub const SHUTTER_RANGE_US: RangeInclusive<i64> = 30..=112_000_000;
/// Sweep FROM, TO and BY, µs.
pub const SWEEP_RANGE_US: RangeInclusive<i64> = 1..=200_000;
/// Lens position, dioptres.
pub const LENS_RANGE: RangeInclusive<f64> = 0.0..=10.0;
/// Colour and analogue gains.
pub const GAIN_RANGE: RangeInclusive<f64> = 1.0..=8.0;
/// Burst pauses must be strictly greater than this, in seconds.
pub const MIN_BURST_PAUSE_S: f64 = 0.7;
/// Minutes between stages.
pub const INTERVAL_RANGE_MIN: RangeInclusive<f64> = 0.0..=120.0;
/// Stages per run.
pub const STAGE_COUNT_RANGE: RangeInclusive<i64> = 1..=100;
/// Lamp preheat, seconds.
pub const PREHEAT_RANGE_S: RangeInclusive<i64> = 1..=180;
/// LED frames per burst.
pub const LED_COUNT_RANGE: RangeInclusive<i64> = 1..=10;
/// Pause between LED frames, whole seconds.
pub const LED_PAUSE_RANGE_S: RangeInclusive<i64> = 1..=10;
/// Load-cell conversions per weighing.
pub const SCALE_SAMPLES_RANGE: RangeInclusive<i64> = 1..=50;

fn text<'a>(field: &'static str, value: &'a str, what: &str) -> AppResult<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(RigError::invalid(field, format!("Please enter {what}.")));
    }
    Ok(value)
}

fn integer(field: &'static str, value: &str, what: &str) -> AppResult<i64> {
    text(field, value, what)?
        .parse()
        .map_err(|_| RigError::invalid(field, format!("{} must be a whole number.", capitalise(what))))
}

fn number(field: &'static str, value: &str, what: &str) -> AppResult<f64> {
    let parsed: f64 = text(field, value, what)?
        .parse()
        .map_err(|_| RigError::invalid(field, format!("{} must be a number.", capitalise(what))))?;
    if !parsed.is_finite() {
        return Err(RigError::invalid(
            field,
            format!("{} must be a finite number.", capitalise(what)),
        ));
    }
    Ok(parsed)
}

fn int_in(
    field: &'static str,
    value: &str,
    what: &str,
    range: RangeInclusive<i64>,
    unit: &str,
) -> AppResult<i64> {
    let v = integer(field, value, what)?;
    if !range.contains(&v) {
        return Err(RigError::invalid(
            field,
            format!(
                "{} must be between {} and {}{}.",
                capitalise(what),
                range.start(),
                range.end(),
                unit
            ),
        ));
    }
    Ok(v)
}

fn float_in(
    field: &'static str,
    value: &str,
    what: &str,
    range: RangeInclusive<f64>,
    unit: &str,
) -> AppResult<f64> {
    let v = number(field, value, what)?;
    if !range.contains(&v) {
        return Err(RigError::invalid(
            field,
            format!(
                "{} must be between {} and {}{}.",
                capitalise(what),
                range.start(),
                range.end(),
                unit
            ),
        ));
    }
    Ok(v)
}

/// Strips a leading "the " and upper-cases the first letter.
fn capitalise(what: &str) -> String {
    let what = what.strip_prefix("the ").unwrap_or(what);
    let mut chars = what.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn pin(field: &'static str, value: &str, role: &str) -> AppResult<LinePin> {
    match pins::select(value) {
        PinSelection::Line(line) => Ok(line),
        PinSelection::NotChosen => Err(RigError::invalid(
            field,
            format!("A GPIO pin must be chosen for {role}."),
        )),
        PinSelection::Unknown => Err(RigError::invalid(
            field,
            format!("Invalid option selected: {}", value.trim()),
        )),
    }
}

/// One capture block of the form: settings key and raw value per field.
struct BurstForm<'a> {
    kind: &'a str,
    prefix: (&'static str, &'a str),
    count: (&'static str, &'a str),
    pause: (&'static str, &'a str),
    save_raw: bool,
}

fn burst(form: BurstForm<'_>) -> AppResult<BurstSettings> {
    let BurstForm {
        kind,
        prefix: (prefix_field, prefix),
        count: (count_field, count),
        pause: (pause_field, pause),
        save_raw,
    } = form;

    let prefix = text(
        prefix_field,
        prefix,
        &format!("a file name prefix for {kind} images"),
    )?;

    let what = format!("the number of {kind} images");
    let image_count = integer(count_field, count, &what)?;
    if image_count <= 0 {
        return Err(RigError::invalid(
            count_field,
            format!("Number of {kind} images must be greater than 0."),
        ));
    }

    let what = format!("the {kind} image capture pause (>{MIN_BURST_PAUSE_S} s)");
    let pause_s = number(pause_field, pause, &what)?;
    if pause_s <= MIN_BURST_PAUSE_S {
        return Err(RigError::invalid(
            pause_field,
            format!("Pause time for {kind} images must be greater than {MIN_BURST_PAUSE_S} seconds."),
        ));
    }

    let pause = Duration::try_from_secs_f64(pause_s).map_err(|_| {
        RigError::invalid(
            pause_field,
            format!("Pause time for {kind} images is too large."),
        )
    })?;

    Ok(BurstSettings {
        prefix: prefix.to_string(),
        image_count: u32::try_from(image_count)
            .map_err(|_| RigError::invalid(count_field, "Image count is too large."))?,
        pause,
        save_raw,
    })
}

fn noise_form(s: &ExperimentSettings) -> BurstForm<'_> {
    BurstForm {
        kind: "noise",
        prefix: ("noise_image_name", &s.noise_image_name),
        count: ("noise_image_capture", &s.noise_image_capture),
        pause: ("pause_between_noise_capture", &s.pause_between_noise_capture),
        save_raw: s.noise_raw,
    }
}

fn illuminated_form(s: &ExperimentSettings) -> BurstForm<'_> {
    BurstForm {
        kind: "illuminated",
        prefix: ("illuminated_image_name", &s.illuminated_image_name),
        count: ("image_capture", &s.image_capture),
        pause: ("pause_between_capture", &s.pause_between_capture),
        save_raw: s.illum_raw,
    }
}

fn shutter(s: &ExperimentSettings) -> AppResult<u32> {
    let shutter = int_in(
        "shutter_speed",
        &s.shutter_speed,
        "the shutter speed [µs]",
        SHUTTER_RANGE_US,
        " µs",
    )?;
    Ok(shutter as u32)
}

fn camera(s: &ExperimentSettings) -> AppResult<CameraSettings> {
    Ok(CameraSettings {
        lens_position: float_in(
            "lens_position",
            &s.lens_position,
            "the lens position",
            LENS_RANGE,
            "",
        )?,
        colour_gain_red: float_in(
            "colour_gain_red",
            &s.colour_gain_red,
            "the red colour gain",
            GAIN_RANGE,
            "",
        )?,
        colour_gain_blue: float_in(
            "colour_gain_blue",
            &s.colour_gain_blue,
            "the blue colour gain",
            GAIN_RANGE,
            "",
        )?,
        analog_gain: float_in(
            "analog_gain",
            &s.analog_gain,
            "the analogue gain",
            GAIN_RANGE,
            "",
        )?,
    })
}

/// Lines already assigned to a role, in assignment order.
struct LineClaims(Vec<(&'static str, LinePin)>);

impl LineClaims {
    /// Records `line` for `role`, or fails on `field` if another role has it.
    fn claim(&mut self, field: &'static str, role: &'static str, line: LinePin) -> AppResult<()> {
        if let Some((owner, _)) = self.0.iter().find(|(_, other)| *other == line) {
            return Err(RigError::invalid(
                field,
                format!(
                    "{} cannot use {}: it is already assigned to {}.",
                    capitalise(role),
                    line.label(),
                    owner
                ),
            ));
        }
        self.0.push((role, line));
        Ok(())
    }
}

/// Validates `settings` for a sequenced run, stopping at the first violation.
pub fn validate(settings: &ExperimentSettings) -> AppResult<ExperimentConfig> {
    let s = settings;

    let noise = burst(noise_form(s))?;
    let illuminated = burst(illuminated_form(s))?;

    let sweep_mode = !s.single_shutter;
    let single_shutter = if sweep_mode { None } else { Some(shutter(s)?) };
    let camera = camera(s)?;

    let interval_minutes = float_in(
        "time_between_experiments",
        &s.time_between_experiments,
        "the time between experiments [min]",
        INTERVAL_RANGE_MIN,
        " minutes",
    )?;
    let stage_count = int_in(
        "number_experiments",
        &s.number_experiments,
        "the number of experiments",
        STAGE_COUNT_RANGE,
        "",
    )?;

    let sweep = match single_shutter {
        Some(shutter_us) => ShutterSweep::Single { shutter_us },
        None => {
            let from = int_in(
                "shutter_speed_from",
                &s.shutter_speed_from,
                "the shutter time FROM [µs]",
                SWEEP_RANGE_US,
                " µs",
            )?;
            let to = int_in(
                "shutter_speed_to",
                &s.shutter_speed_to,
                "the shutter time TO [µs]",
                SWEEP_RANGE_US,
                " µs",
            )?;
            let by = int_in(
                "shutter_speed_by",
                &s.shutter_speed_by,
                "the shutter time BY [µs]",
                SWEEP_RANGE_US,
                " µs",
            )?;
            if from >= to {
                return Err(RigError::invalid(
                    "shutter_speed_from",
                    "Shutter time FROM must be less than TO.",
                ));
            }
            let diff = to - from;
            if diff % by != 0 {
                return Err(RigError::invalid(
                    "shutter_speed_by",
                    format!(
                        "The difference between FROM and TO ({diff} µs) must be divisible by BY ({by} µs)."
                    ),
                ));
            }
            ShutterSweep::Range {
                from_us: from as u32,
                to_us: to as u32,
                by_us: by as u32,
            }
        }
    };

    let preheat_s = int_in(
        "preheat",
        &s.preheat,
        "the lamp preheat time [s]",
        PREHEAT_RANGE_S,
        " s",
    )?;

    if s.lamp_drive.trim() == EXTERNAL_SOURCE {
        return Err(RigError::invalid(
            "lamp_drive",
            "A GPIO pin must be chosen for the lamp in sequenced runs.",
        ));
    }
    let lamp = pin("lamp_drive", &s.lamp_drive, "the lamp")?;
    let mut claims = LineClaims(vec![("the lamp", lamp)]);

    let led = if s.led_capture_checkbox {
        let first = pin("led1_combobox", &s.led1_combobox, "LED1")?;
        claims.claim("led1_combobox", "LED1", first)?;
        let second = pin("led2_combobox", &s.led2_combobox, "LED2")?;
        claims.claim("led2_combobox", "LED2", second)?;
        let count = int_in(
            "led_image_count",
            &s.led_image_count,
            "the number of LED images",
            LED_COUNT_RANGE,
            "",
        )?;
        let pause = int_in(
            "pause_between_led_capture",
            &s.pause_between_led_capture,
            "the pause between LED image capture",
            LED_PAUSE_RANGE_S,
            " seconds",
        )?;
        let prefix = text(
            "led_image_name",
            &s.led_image_name,
            "a file name prefix for the LED images",
        )?;
        Some(LedSettings {
            lines: [first, second],
            burst: BurstSettings {
                prefix: prefix.to_string(),
                image_count: count as u32,
                pause: Duration::from_secs(pause as u64),
                save_raw: s.led_raw,
            },
        })
    } else {
        None
    };

    let scale = if s.scale_check {
        let data_pin = pin("dat", &s.dat, "the scale DAT line")?;
        claims.claim("dat", "the scale DAT line", data_pin)?;
        let clock_pin = pin("clk", &s.clk, "the scale CLK line")?;
        claims.claim("clk", "the scale CLK line", clock_pin)?;
        let reference_unit = number("ref_unit", &s.ref_unit, "the reference unit")?;
        if reference_unit == 0.0 {
            return Err(RigError::invalid("ref_unit", "Reference unit must not be zero."));
        }
        let samples = int_in(
            "scale_num",
            &s.scale_num,
            "the number of scale measurements",
            SCALE_SAMPLES_RANGE,
            "",
        )?;
        Some(ScaleSettings {
            data_pin,
            clock_pin,
            reference_unit,
            samples: samples as usize,
        })
    } else {
        None
    };

    Ok(ExperimentConfig {
        camera,
        sweep,
        noise,
        illuminated,
        led,
        scale,
        lamp,
        save_metadata: s.metadata,
        stage_count: stage_count as u32,
        interval_minutes,
        preheat: Duration::from_secs(preheat_s as u64),
    })
}

/// Checks only the blocks a one-off burst of `kind` needs: that burst, the
/// typed shutter speed and the camera values. Sweep, timing, lamp, LED and
/// scale fields are ignored.
pub fn validate_single(
    settings: &ExperimentSettings,
    kind: CaptureKind,
) -> AppResult<SingleCapture> {
    let form = match kind {
        CaptureKind::Noise => noise_form(settings),
        CaptureKind::Illuminated => illuminated_form(settings),
    };
    let burst = burst(form)?;
    let shutter_us = shutter(settings)?;
    let camera = camera(settings)?;
    Ok(SingleCapture {
        kind,
        camera,
        shutter_us,
        burst,
        save_metadata: settings.metadata,
    })
}
