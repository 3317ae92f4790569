//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::{ProfileInfo, RunReport};

/// Left-aligned columns separated by three spaces, headers upper-cased
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return "No profiles configured.\n".to_string();
    }

    let widths: Vec<usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            rows.iter()
                .filter_map(|r| r.get(i))
                .map(String::len)
                .fold(h.len(), usize::max)
        })
        .collect();

    let render = |cells: Vec<String>| -> String {
        let line = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:width$}", cell, width = width))
            .collect::<Vec<_>>()
            .join("   ");
        format!("{}\n", line.trim_end())
    };

    let mut output = render(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        output.push_str(&render(row.clone()));
    }
    output
}

pub fn format_profiles(profiles: &[ProfileInfo]) -> String {
    let rows: Vec<Vec<String>> = profiles
        .iter()
        .map(|p| {
            vec![
                if p.is_default { "*" } else { "" }.to_string(),
                p.name.clone(),
                p.kind.clone(),
                p.target.clone(),
            ]
        })
        .collect();
    format_table(&["default", "name", "kind", "target"], &rows)
}

/// Pretty JSON for `offload run`
pub fn format_run_report(report: &RunReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::Outputs;
    use serde_json::json;

    #[test]
    fn test_format_profiles() {
        let profiles = vec![
            ProfileInfo {
                name: "cluster".to_string(),
                kind: "http".to_string(),
                target: "http://a:8090".to_string(),
                is_default: false,
            },
            ProfileInfo {
                name: "lab".to_string(),
                kind: "local".to_string(),
                target: "2 workers".to_string(),
                is_default: true,
            },
        ];
        let output = format_profiles(&profiles);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("DEFAULT"));
        assert!(lines[2].starts_with('*'));
        assert!(lines[2].contains("2 workers"));
    }

    #[test]
    fn test_format_empty() {
        assert_eq!(format_profiles(&[]), "No profiles configured.\n");
    }

    #[test]
    fn test_format_run_report() {
        let mut outputs = Outputs::new();
        outputs.insert("y".to_string(), json!(4.0));
        let report = RunReport {
            profile: "lab".to_string(),
            outputs,
            execution: None,
            error: None,
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&format_run_report(&report)).unwrap();
        assert_eq!(parsed, json!({"profile": "lab", "outputs": {"y": 4.0}}));
    }
}
