use std::path::Path;

use crate::error::StampedeError;
use crate::model::TestConfiguration;

/// Read a test configuration file from disk.
///
/// The file format is JSON-serialized [`TestConfiguration`]; field aliases
/// (`vus` for `virtual_users`) are tolerated by the model itself.
pub async fn read_config(path: impl AsRef<Path>) -> Result<TestConfiguration, StampedeError> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    let config: TestConfiguration = serde_json::from_str(&content)?;
    Ok(config)
}

/// Write a [`TestConfiguration`] to disk as pretty-printed JSON.
pub async fn write_config(
    config: &TestConfiguration,
    path: impl AsRef<Path>,
) -> Result<(), StampedeError> {
    let content = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path.as_ref(), content).await?;
    Ok(())
}
