//! JSON output

use std::fs;
use std::path::Path;

use crate::client::SessionReport;

pub fn output_json(report: &SessionReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
}

pub fn save_json(report: &SessionReport, path: &Path) -> anyhow::Result<()> {
    let json = output_json(report);
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientConfig};

    #[tokio::test]
    async fn test_failed_report_serializes_status() {
        // Nothing listens on port 1; the session fails in the connect phase
        let client = Client::new(ClientConfig {
            port: Some(1),
            ..Default::default()
        });
        let report = client.run(None).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&output_json(&report)).unwrap();
        assert_eq!(value["status"]["state"], "failed");
        assert!(
            value["status"]["message"]
                .as_str()
                .unwrap()
                .contains("unable to connect")
        );
        assert_eq!(value["requested_tests"], 54);
        assert_eq!(value["json_dialect"], false);
        assert!(value.get("classification").is_none());
    }
}
