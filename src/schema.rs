use std::{fs, path::Path};

use anyhow::Result;
use schemars::schema_for;

use crate::rule::RuleFile;

pub const RULES_SCHEMA_FILE: &str = "rules.schema.json";

/// Writes the JSON schema of the rule file format into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)?;
    let schema = schema_for!(RuleFile);
    fs::write(
        out_dir.join(RULES_SCHEMA_FILE),
        serde_json::to_string_pretty(&schema)?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    #[test]
    fn writes_the_rule_file_schema() {
        let dir = TempDir::new().unwrap();
        write_schema(dir.path()).unwrap();

        let raw = fs::read_to_string(dir.path().join(RULES_SCHEMA_FILE)).unwrap();
        let schema: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(schema["title"], "RuleFile");
        assert!(schema["properties"]["rules"].is_object());
        assert!(raw.contains("influxAuto"));
    }
}
