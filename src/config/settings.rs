//! Settings file as written by the acquisition form.
//!
//! Field names are the on-disk JSON keys, so existing settings files load
//! unchanged. Numeric fields hold the text as typed; files that store them as
//! JSON numbers are accepted too. Missing keys take the blank-form defaults.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

use crate::error::{AppResult, RigError};
use crate::hardware::pins::{EXTERNAL_SOURCE, NO_SELECTION};

/// Raw, unvalidated experiment settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentSettings {
    // Camera
    /// Exposure in microseconds for single-shutter mode and one-off captures.
    #[serde(deserialize_with = "text_or_number")]
    pub shutter_speed: String,
    /// Lens focus position.
    #[serde(deserialize_with = "text_or_number")]
    pub lens_position: String,
    /// Red white-balance gain.
    #[serde(deserialize_with = "text_or_number")]
    pub colour_gain_red: String,
    /// Blue white-balance gain.
    #[serde(deserialize_with = "text_or_number")]
    pub colour_gain_blue: String,
    /// Sensor analogue gain.
    #[serde(deserialize_with = "text_or_number")]
    pub analog_gain: String,
    /// Lamp warm-up before the illuminated phase of a stage, in seconds.
    #[serde(deserialize_with = "text_or_number")]
    pub preheat: String,

    // Illuminated capture
    /// Illuminated frames per burst.
    #[serde(deserialize_with = "text_or_number")]
    pub image_capture: String,
    /// Write a `.dng` next to every illuminated frame.
    pub illum_raw: bool,
    /// Seconds between illuminated frames.
    #[serde(deserialize_with = "text_or_number")]
    pub pause_between_capture: String,
    /// Filename prefix for illuminated frames.
    pub illuminated_image_name: String,
    /// Header label of the lamp line, or the external-source option.
    pub lamp_drive: String,

    // Noise capture
    /// Form checkbox; noise bursts always run.
    pub toggle_capture_noise: bool,
    /// Write a `.dng` next to every noise frame.
    pub noise_raw: bool,
    /// Noise frames per burst.
    #[serde(deserialize_with = "text_or_number")]
    pub noise_image_capture: String,
    /// Filename prefix for noise frames.
    pub noise_image_name: String,
    /// Seconds between noise frames.
    #[serde(deserialize_with = "text_or_number")]
    pub pause_between_noise_capture: String,

    // LED capture
    /// Header label of the first LED line.
    pub led1_combobox: String,
    /// Header label of the second LED line.
    pub led2_combobox: String,
    /// Enables the LED phase.
    pub led_capture_checkbox: bool,
    /// Write a `.dng` next to every LED frame.
    pub led_raw: bool,
    /// LED frames per burst.
    #[serde(deserialize_with = "text_or_number")]
    pub led_image_count: String,
    /// Whole seconds between LED frames.
    #[serde(deserialize_with = "text_or_number")]
    pub pause_between_led_capture: String,
    /// Filename prefix for LED frames.
    pub led_image_name: String,
    /// Kept so form files round-trip; sequenced runs write LED frames under the run root.
    pub led_image_output_path: String,

    // Advanced
    /// Write a `.json` metadata sidecar next to every frame.
    pub metadata: bool,
    /// Form checkbox for the advanced tab.
    pub toggle_experiment_mode: bool,
    /// Use `shutter_speed` instead of the FROM/TO/BY sweep.
    pub single_shutter: bool,
    /// Form radio button paired with `single_shutter`.
    pub multiple_shutter: bool,
    /// First shutter speed of the sweep.
    #[serde(deserialize_with = "text_or_number")]
    pub shutter_speed_from: String,
    /// Last shutter speed of the sweep.
    #[serde(deserialize_with = "text_or_number")]
    pub shutter_speed_to: String,
    /// Sweep step.
    #[serde(deserialize_with = "text_or_number")]
    pub shutter_speed_by: String,
    /// Number of stages.
    #[serde(deserialize_with = "text_or_number")]
    pub number_experiments: String,
    /// Minutes between stage starts.
    #[serde(deserialize_with = "text_or_number")]
    pub time_between_experiments: String,

    // Scale
    /// Enables the scale phase.
    pub scale_check: bool,
    /// Header label of the HX711 data line.
    pub dat: String,
    /// Header label of the HX711 clock line.
    pub clk: String,
    /// Raw counts per gram.
    #[serde(deserialize_with = "text_or_number")]
    pub ref_unit: String,
    /// Samples per weighing.
    #[serde(deserialize_with = "text_or_number")]
    pub scale_num: String,
}

impl Default for ExperimentSettings {
    /// A blank form.
    fn default() -> Self {
        Self {
            shutter_speed: String::new(),
            lens_position: String::new(),
            colour_gain_red: String::new(),
            colour_gain_blue: String::new(),
            analog_gain: String::new(),
            preheat: String::new(),
            image_capture: String::new(),
            illum_raw: false,
            pause_between_capture: String::new(),
            illuminated_image_name: String::new(),
            lamp_drive: EXTERNAL_SOURCE.to_string(),
            toggle_capture_noise: false,
            noise_raw: false,
            noise_image_capture: String::new(),
            noise_image_name: String::new(),
            pause_between_noise_capture: String::new(),
            led1_combobox: NO_SELECTION.to_string(),
            led2_combobox: NO_SELECTION.to_string(),
            led_capture_checkbox: false,
            led_raw: false,
            led_image_count: NO_SELECTION.to_string(),
            pause_between_led_capture: NO_SELECTION.to_string(),
            led_image_name: String::new(),
            led_image_output_path: String::new(),
            metadata: false,
            toggle_experiment_mode: false,
            single_shutter: false,
            multiple_shutter: false,
            shutter_speed_from: String::new(),
            shutter_speed_to: String::new(),
            shutter_speed_by: String::new(),
            number_experiments: String::new(),
            time_between_experiments: String::new(),
            scale_check: false,
            dat: NO_SELECTION.to_string(),
            clk: NO_SELECTION.to_string(),
            ref_unit: String::new(),
            scale_num: String::new(),
        }
    }
}

impl ExperimentSettings {
    /// Reads a settings file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| RigError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| {
            RigError::Settings(format!("cannot parse {}: {}", path.display(), e))
        })
    }

    /// Writes the settings as pretty JSON.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(path, body).map_err(|e| RigError::io(path, e))
    }
}

/// Accepts `"12"`, `12`, `12.5` or `null` for a text field.
fn text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Field {
        Text(String),
        Int(i64),
        Float(f64),
        Null,
    }

    Ok(match Field::deserialize(deserializer)? {
        Field::Text(s) => s,
        Field::Int(i) => i.to_string(),
        Field::Float(f) => f.to_string(),
        Field::Null => String::new(),
    })
}
