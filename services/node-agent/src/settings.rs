//! Node settings: parsing, validation, and the defensive copy dance.
//!
//! Settings arrive as `Settings.xml` (one `Section Name="NTServiceSettings"`
//! with `Parameter Name=... Value=...` children). A validated copy is kept
//! under `Data/`; when the live file stops parsing, the copy takes over and
//! the live file is restored from it. Invalid values reject the whole load so
//! the previous known-good settings stay in effect.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use pos_schedule::{Frequency, FrequencyParseError};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use tracing::{info, warn};

use crate::workdir::{WorkDir, WorkDirError};

/// Section the agent reads from the settings file.
const SETTINGS_SECTION: &str = "NTServiceSettings";

/// Errors from settings loading.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings xml malformed: {0}")]
    Xml(String),

    #[error("settings file has no '{SETTINGS_SECTION}' section")]
    MissingSection,

    #[error("invalid value '{value}' for setting {key}")]
    InvalidValue { key: String, value: String },

    #[error("invalid update frequency: {0}")]
    Frequency(#[from] FrequencyParseError),

    #[error(transparent)]
    WorkDir(#[from] WorkDirError),

    #[error("settings file missing or unreadable: {0}")]
    Unreadable(String),
}

/// Per-node agent settings, all optional on disk with these defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSettings {
    /// Update engine query string.
    pub wu_query: String,

    /// Retries per external operation (search/download/install).
    pub operation_retry_count: u32,

    /// Delay between retries and between approval polls.
    pub delay_between_retries: Duration,

    /// Wall-clock bound per external operation.
    pub wu_operation_timeout: Duration,

    /// How far a failed cycle pushes the next attempt.
    pub reschedule_time: Duration,

    /// Reschedules allowed before the operation is abandoned.
    pub reschedule_count: u32,

    pub frequency: Frequency,

    /// Apply the host's notify-before-download policy on startup.
    pub disable_auto_update: bool,

    /// Deadline for coordinator RPC calls.
    pub operation_timeout: Duration,

    /// Restrict eligible updates to the fixed OS-updates category.
    pub install_os_only_updates: bool,

    /// Category whitelist; empty admits everything.
    pub category_ids: Vec<String>,

    pub accept_eula: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            wu_query: "IsInstalled=0".to_string(),
            operation_retry_count: 5,
            delay_between_retries: Duration::from_secs(60),
            wu_operation_timeout: Duration::from_secs(90 * 60),
            reschedule_time: Duration::from_secs(30 * 60),
            reschedule_count: 5,
            frequency: "Weekly,Wednesday,7:00:00".parse().expect("default frequency"),
            disable_auto_update: true,
            operation_timeout: Duration::from_secs(5 * 60),
            install_os_only_updates: false,
            category_ids: Vec::new(),
            accept_eula: true,
        }
    }
}

impl NodeSettings {
    /// Installation timeout in whole minutes, as recorded on repair tasks.
    pub fn wu_operation_timeout_minutes(&self) -> i64 {
        (self.wu_operation_timeout.as_secs() / 60) as i64
    }

    /// Parse the settings XML document.
    pub fn from_xml(xml: &str) -> Result<Self, SettingsError> {
        let parameters = read_parameters(xml)?;
        Self::from_parameters(parameters)
    }

    fn from_parameters(parameters: HashMap<String, String>) -> Result<Self, SettingsError> {
        let mut settings = Self::default();

        for (key, value) in &parameters {
            match key.as_str() {
                "WUQuery" => settings.wu_query = value.clone(),
                "WUOperationRetryCount" => {
                    settings.operation_retry_count = parse_number(key, value)?
                }
                "WUDelayBetweenRetriesInMinutes" => {
                    settings.delay_between_retries = parse_minutes(key, value)?
                }
                "WUOperationTimeOutInMinutes" => {
                    settings.wu_operation_timeout = parse_minutes(key, value)?
                }
                "WURescheduleTimeInMinutes" => {
                    settings.reschedule_time = parse_minutes(key, value)?
                }
                "WURescheduleCount" => settings.reschedule_count = parse_number(key, value)?,
                "WUFrequency" => settings.frequency = value.parse()?,
                "DisableAutoUpdateSettingInOS" => {
                    settings.disable_auto_update = parse_bool(key, value)?
                }
                "OperationTimeOutInMinutes" => {
                    settings.operation_timeout = parse_minutes(key, value)?
                }
                "InstallWindowsOSOnlyUpdates" => {
                    settings.install_os_only_updates = parse_bool(key, value)?
                }
                "WUQueryCategoryIds" => {
                    settings.category_ids = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                "AcceptWindowsUpdateEula" => settings.accept_eula = parse_bool(key, value)?,
                other => warn!(key = other, "Ignoring unknown setting"),
            }
        }

        Ok(settings)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u32, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_minutes(key: &str, value: &str) -> Result<Duration, SettingsError> {
    let minutes: u64 = value.trim().parse().map_err(|_| SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })?;
    Ok(Duration::from_secs(minutes * 60))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Pull the `Parameter` name/value pairs out of the target section.
fn read_parameters(xml: &str) -> Result<HashMap<String, String>, SettingsError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut parameters = HashMap::new();
    let mut in_target_section = false;
    let mut saw_target_section = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"Section" => {
                    let name = attribute(e, b"Name")?;
                    in_target_section = name.as_deref() == Some(SETTINGS_SECTION);
                    saw_target_section |= in_target_section;
                }
                b"Parameter" if in_target_section => {
                    let name = attribute(e, b"Name")?;
                    let value = attribute(e, b"Value")?;
                    if let (Some(name), Some(value)) = (name, value) {
                        parameters.insert(name, value);
                    }
                }
                _ => {}
            },
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Section" => {
                in_target_section = false;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(SettingsError::Xml(e.to_string())),
        }
    }

    if !saw_target_section {
        return Err(SettingsError::MissingSection);
    }
    Ok(parameters)
}

fn attribute(
    element: &quick_xml::events::BytesStart<'_>,
    key: &[u8],
) -> Result<Option<String>, SettingsError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| SettingsError::Xml(e.to_string()))?;
        if attr.key.as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|e| SettingsError::Xml(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Load settings from the live file, falling back to the validated copy.
///
/// - Live file parses: refresh the copy (staged through the temp copy) and
///   return the settings.
/// - Live file broken, copy parses: restore the live file from the copy.
/// - Both broken: error; the caller keeps its previous known-good settings.
pub fn load_with_fallback(workdir: &WorkDir) -> Result<NodeSettings, SettingsError> {
    let live_path = workdir.settings_file();

    let live = fs::read_to_string(&live_path)
        .map_err(|e| SettingsError::Unreadable(format!("{}: {e}", live_path.display())));

    match live.and_then(|content| NodeSettings::from_xml(&content).map(|s| (content, s))) {
        Ok((content, settings)) => {
            // Stage through the temp copy so a crash never leaves a torn copy.
            workdir.write_atomic(&workdir.temp_copy_of_settings(), &content)?;
            fs::rename(workdir.temp_copy_of_settings(), workdir.copy_of_settings()).map_err(
                |e| {
                    SettingsError::Unreadable(format!(
                        "{}: {e}",
                        workdir.copy_of_settings().display()
                    ))
                },
            )?;
            Ok(settings)
        }
        Err(live_error) => {
            warn!(error = %live_error, "Live settings unusable, trying the validated copy");
            let copy = fs::read_to_string(workdir.copy_of_settings())
                .map_err(|e| SettingsError::Unreadable(e.to_string()))?;
            let settings = NodeSettings::from_xml(&copy)?;
            workdir.write_atomic(&live_path, &copy)?;
            info!("Restored live settings file from the validated copy");
            Ok(settings)
        }
    }
}

/// Whether the live settings differ from the validated copy.
pub fn settings_changed(workdir: &WorkDir) -> Result<bool, SettingsError> {
    let live = workdir.file_hash(&workdir.settings_file())?;
    let copy = workdir.file_hash(&workdir.copy_of_settings())?;
    Ok(live.is_some() && live != copy)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Settings>
  <Section Name="NTServiceSettings">
    <Parameter Name="WUQuery" Value="IsInstalled=0 and IsHidden=0" />
    <Parameter Name="WUOperationRetryCount" Value="3" />
    <Parameter Name="WUDelayBetweenRetriesInMinutes" Value="2" />
    <Parameter Name="WUOperationTimeOutInMinutes" Value="120" />
    <Parameter Name="WURescheduleTimeInMinutes" Value="15" />
    <Parameter Name="WURescheduleCount" Value="4" />
    <Parameter Name="WUFrequency" Value="Daily,3:00:00" />
    <Parameter Name="DisableAutoUpdateSettingInOS" Value="false" />
    <Parameter Name="OperationTimeOutInMinutes" Value="10" />
    <Parameter Name="InstallWindowsOSOnlyUpdates" Value="true" />
    <Parameter Name="WUQueryCategoryIds" Value="aaaa, bbbb" />
    <Parameter Name="AcceptWindowsUpdateEula" Value="false" />
  </Section>
</Settings>"#;

    #[test]
    fn test_full_document() {
        let settings = NodeSettings::from_xml(FULL_XML).unwrap();
        assert_eq!(settings.wu_query, "IsInstalled=0 and IsHidden=0");
        assert_eq!(settings.operation_retry_count, 3);
        assert_eq!(settings.delay_between_retries, Duration::from_secs(120));
        assert_eq!(settings.wu_operation_timeout, Duration::from_secs(120 * 60));
        assert_eq!(settings.wu_operation_timeout_minutes(), 120);
        assert_eq!(settings.reschedule_time, Duration::from_secs(15 * 60));
        assert_eq!(settings.reschedule_count, 4);
        assert_eq!(settings.frequency, "Daily,3:00:00".parse().unwrap());
        assert!(!settings.disable_auto_update);
        assert_eq!(settings.operation_timeout, Duration::from_secs(10 * 60));
        assert!(settings.install_os_only_updates);
        assert_eq!(settings.category_ids, vec!["aaaa", "bbbb"]);
        assert!(!settings.accept_eula);
    }

    #[test]
    fn test_empty_section_yields_defaults() {
        let xml = r#"<Settings><Section Name="NTServiceSettings" /></Settings>"#;
        let settings = NodeSettings::from_xml(xml).unwrap();
        assert_eq!(settings, NodeSettings::default());
    }

    #[test]
    fn test_other_sections_ignored() {
        let xml = r#"<Settings>
  <Section Name="Other"><Parameter Name="WUOperationRetryCount" Value="99" /></Section>
  <Section Name="NTServiceSettings"><Parameter Name="WUOperationRetryCount" Value="2" /></Section>
</Settings>"#;
        let settings = NodeSettings::from_xml(xml).unwrap();
        assert_eq!(settings.operation_retry_count, 2);
    }

    #[test]
    fn test_missing_section_rejected() {
        let xml = r#"<Settings><Section Name="Other" /></Settings>"#;
        assert!(matches!(
            NodeSettings::from_xml(xml),
            Err(SettingsError::MissingSection)
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for (name, value) in [
            ("WUOperationRetryCount", "many"),
            ("WUFrequency", "Fortnightly,7:00:00"),
            ("DisableAutoUpdateSettingInOS", "maybe"),
            ("WUOperationTimeOutInMinutes", "-1"),
        ] {
            let xml = format!(
                r#"<Settings><Section Name="NTServiceSettings"><Parameter Name="{name}" Value="{value}" /></Section></Settings>"#
            );
            assert!(NodeSettings::from_xml(&xml).is_err(), "{name}={value}");
        }
    }

    #[test]
    fn test_malformed_xml_rejected() {
        assert!(matches!(
            NodeSettings::from_xml("<Settings><Section"),
            Err(SettingsError::Xml(_))
        ));
    }

    #[test]
    fn test_load_refreshes_copy() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        workdir.ensure_layout().unwrap();
        fs::write(workdir.settings_file(), FULL_XML).unwrap();

        let settings = load_with_fallback(&workdir).unwrap();
        assert_eq!(settings.operation_retry_count, 3);
        assert_eq!(fs::read_to_string(workdir.copy_of_settings()).unwrap(), FULL_XML);
        assert!(!settings_changed(&workdir).unwrap());
    }

    #[test]
    fn test_broken_live_restored_from_copy() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        workdir.ensure_layout().unwrap();
        fs::write(workdir.settings_file(), FULL_XML).unwrap();
        load_with_fallback(&workdir).unwrap();

        // The live file is corrupted afterwards.
        fs::write(workdir.settings_file(), "<Settings><garbage").unwrap();
        assert!(settings_changed(&workdir).unwrap());

        let settings = load_with_fallback(&workdir).unwrap();
        assert_eq!(settings.operation_retry_count, 3);
        assert_eq!(fs::read_to_string(workdir.settings_file()).unwrap(), FULL_XML);
    }

    #[test]
    fn test_both_broken_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        workdir.ensure_layout().unwrap();
        fs::write(workdir.settings_file(), "not xml at all <").unwrap();

        assert!(load_with_fallback(&workdir).is_err());
    }

    #[test]
    fn test_change_detection() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        workdir.ensure_layout().unwrap();
        fs::write(workdir.settings_file(), FULL_XML).unwrap();
        load_with_fallback(&workdir).unwrap();

        let updated = FULL_XML.replace("Daily,3:00:00", "Hourly,30");
        fs::write(workdir.settings_file(), updated).unwrap();
        assert!(settings_changed(&workdir).unwrap());

        load_with_fallback(&workdir).unwrap();
        assert!(!settings_changed(&workdir).unwrap());
    }
}
