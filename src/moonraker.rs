//! Moonraker print-status client
//!
//! Any failure (connection refused, timeout, bad JSON) reads as
//! "unreachable" so the caller can decide whether to go on without it.

use std::time::Duration;

use kflash_core::status::{PrintStatus, PrintStatusSource, PrinterState};
use kflash_core::versions::McuVersions;
use log::debug;
use serde::Deserialize;
use serde_json::Value;

const TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_QUERY: &str = "/printer/objects/query?print_stats&virtual_sdcard";
const OBJECTS_LIST: &str = "/printer/objects/list";

#[derive(Debug, Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    status: ObjectStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectStatus {
    #[serde(default)]
    print_stats: PrintStats,
    #[serde(default)]
    virtual_sdcard: VirtualSdcard,
}

#[derive(Debug, Default, Deserialize)]
struct PrintStats {
    state: Option<String>,
    filename: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VirtualSdcard {
    progress: Option<f64>,
}

/// Decode a `print_stats`/`virtual_sdcard` query response
pub fn parse_status(body: &str) -> Result<PrintStatus, serde_json::Error> {
    let response: QueryResponse = serde_json::from_str(body)?;
    let status = response.result.status;
    Ok(PrintStatus {
        state: PrinterState::from_moonraker(
            status.print_stats.state.as_deref().unwrap_or("standby"),
        ),
        filename: status.print_stats.filename.filter(|f| !f.is_empty()),
        progress: status.virtual_sdcard.progress.unwrap_or(0.0),
    })
}

#[derive(Debug, Deserialize)]
struct ObjectsResponse {
    result: ObjectsResult,
}

#[derive(Debug, Deserialize)]
struct ObjectsResult {
    objects: Vec<String>,
}

/// Pick the `mcu` and `mcu <name>` objects out of an object list response
pub fn parse_mcu_objects(body: &str) -> Result<Vec<String>, serde_json::Error> {
    let response: ObjectsResponse = serde_json::from_str(body)?;
    Ok(response
        .result
        .objects
        .into_iter()
        .filter(|o| o == "mcu" || o.starts_with("mcu "))
        .collect())
}

/// Decode the `mcu_version` of each queried MCU object.
///
/// The primary `mcu` object is reported as `main`; `mcu EBB` becomes `EBB`.
pub fn parse_mcu_versions(body: &str) -> Result<McuVersions, serde_json::Error> {
    let response: Value = serde_json::from_str(body)?;
    let mut versions = McuVersions::new();
    if let Some(status) = response.pointer("/result/status").and_then(Value::as_object) {
        for (object, fields) in status {
            let Some(version) = fields.get("mcu_version").and_then(Value::as_str) else {
                continue;
            };
            let name = match object.strip_prefix("mcu ") {
                Some(name) => name.to_string(),
                None if object == "mcu" => "main".to_string(),
                None => continue,
            };
            versions.insert(name, version.to_string());
        }
    }
    Ok(versions)
}

/// Blocking HTTP client for one Moonraker instance
pub struct MoonrakerClient {
    base_url: String,
    client: Option<reqwest::blocking::Client>,
}

impl MoonrakerClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| debug!("Cannot create HTTP client: {}", e))
            .ok();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn fetch(&self, query: &str) -> Result<String, Box<dyn std::error::Error>> {
        let client = self.client.as_ref().ok_or("no HTTP client")?;
        let url = format!("{}{}", self.base_url, query);
        debug!("GET {}", url);
        let body = client.get(&url).send()?.error_for_status()?.text()?;
        Ok(body)
    }

    fn fetch_mcu_versions(&self) -> Result<McuVersions, Box<dyn std::error::Error>> {
        let objects = parse_mcu_objects(&self.fetch(OBJECTS_LIST)?)?;
        if objects.is_empty() {
            return Ok(McuVersions::new());
        }
        let query = objects
            .iter()
            .map(|o| o.replace(' ', "%20"))
            .collect::<Vec<_>>()
            .join("&");
        let body = self.fetch(&format!("/printer/objects/query?{}", query))?;
        Ok(parse_mcu_versions(&body)?)
    }
}

impl PrintStatusSource for MoonrakerClient {
    fn get_status(&self) -> Option<PrintStatus> {
        let body = match self.fetch(STATUS_QUERY) {
            Ok(body) => body,
            Err(e) => {
                debug!("Moonraker unreachable: {}", e);
                return None;
            }
        };
        match parse_status(&body) {
            Ok(status) => Some(status),
            Err(e) => {
                debug!("Unexpected Moonraker response: {}", e);
                None
            }
        }
    }

    fn mcu_versions(&self) -> Option<McuVersions> {
        match self.fetch_mcu_versions() {
            Ok(versions) if !versions.is_empty() => Some(versions),
            Ok(_) => {
                debug!("Moonraker reported no MCU versions");
                None
            }
            Err(e) => {
                debug!("Cannot read MCU versions: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_printing() {
        let body = r#"{"result": {"eventtime": 1234.5, "status": {
            "print_stats": {"state": "printing", "filename": "benchy.gcode"},
            "virtual_sdcard": {"progress": 0.25, "is_active": true}}}}"#;
        let status = parse_status(body).unwrap();
        assert_eq!(status.state, PrinterState::Printing);
        assert_eq!(status.filename.as_deref(), Some("benchy.gcode"));
        assert_eq!(status.progress, 0.25);
    }

    #[test]
    fn test_parse_idle_defaults() {
        let body = r#"{"result": {"status": {"print_stats": {"state": "standby", "filename": ""}}}}"#;
        let status = parse_status(body).unwrap();
        assert_eq!(status.state, PrinterState::Idle);
        assert_eq!(status.filename, None);
        assert_eq!(status.progress, 0.0);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_status("<html>502</html>").is_err());
        assert!(parse_status(r#"{"error": {"code": 404}}"#).is_err());
    }

    #[test]
    fn test_unreachable_is_none() {
        // Port 9 (discard) is closed on test hosts
        let client = MoonrakerClient::new("http://127.0.0.1:9/");
        assert!(client.get_status().is_none());
    }

    #[test]
    fn test_parse_mcu_objects() {
        let body = r#"{"result": {"objects": ["webhooks", "mcu", "mcu EBB",
            "mcu_temperature", "print_stats", "temperature_sensor mcu_temp"]}}"#;
        assert_eq!(parse_mcu_objects(body).unwrap(), vec!["mcu", "mcu EBB"]);
    }

    #[test]
    fn test_parse_mcu_versions() {
        let body = r#"{"result": {"eventtime": 10.0, "status": {
            "mcu": {"mcu_version": "v0.12.0-45-g7ce409d", "mcu_build_versions": "gcc"},
            "mcu EBB": {"mcu_version": "v0.12.0-40-gabc1234"},
            "mcu broken": {}}}}"#;
        let versions = parse_mcu_versions(body).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions["main"], "v0.12.0-45-g7ce409d");
        assert_eq!(versions["EBB"], "v0.12.0-40-gabc1234");
    }

    #[test]
    fn test_unreachable_has_no_versions() {
        let client = MoonrakerClient::new("http://127.0.0.1:9");
        assert!(client.mcu_versions().is_none());
    }
}
