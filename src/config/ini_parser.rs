//! Minimal INI reader for the service configuration file.
//!
//! Supports `[section]` headers, `key = value` pairs, full-line comments
//! starting with `#` or `;`, inline comments introduced by ` #` or ` ;`,
//! optional double quotes around values, booleans, comma-separated lists and
//! byte sizes with `KB`/`MB`/`GB`/`TB` suffixes. Keys outside any section land
//! in the global section, addressed with an empty section name.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct IniConfig {
    sections: HashMap<String, HashMap<String, String>>,
}

impl IniConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let mut config = Self::new();
        let mut current_section = String::new();

        for (index, raw_line) in content.lines().enumerate() {
            let line_number = index + 1;
            let line = raw_line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest
                    .strip_suffix(']')
                    .ok_or_else(|| format!("Unterminated section header at line {line_number}"))?
                    .trim();
                if name.is_empty() {
                    return Err(format!("Empty section name at line {line_number}"));
                }
                current_section = name.to_lowercase();
                config.sections.entry(current_section.clone()).or_default();
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("Invalid syntax at line {line_number}: {line}"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(format!("Empty key at line {line_number}"));
            }

            config
                .sections
                .entry(current_section.clone())
                .or_default()
                .insert(key.to_lowercase(), clean_value(value));
        }

        Ok(config)
    }

    pub fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.sections
            .get(&section.to_lowercase())?
            .get(&key.to_lowercase())
            .filter(|v| !v.is_empty())
            .cloned()
    }

    pub fn get_u16(&self, section: &str, key: &str) -> Option<u16> {
        self.get_string(section, key)?.parse().ok()
    }

    pub fn get_u64(&self, section: &str, key: &str) -> Option<u64> {
        self.get_string(section, key)?.parse().ok()
    }

    pub fn get_usize(&self, section: &str, key: &str) -> Option<usize> {
        self.get_string(section, key)?.parse().ok()
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        match self.get_string(section, key)?.to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Some(true),
            "false" | "no" | "0" | "off" => Some(false),
            _ => None,
        }
    }

    /// Comma-separated list, blank items dropped. Empty when the key is
    /// missing.
    pub fn get_list(&self, section: &str, key: &str) -> Vec<String> {
        self.get_string(section, key)
            .map(|s| {
                s.split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Byte size such as `800MB` or `1.5GB`
    pub fn get_file_size(&self, section: &str, key: &str) -> Option<u64> {
        parse_file_size(&self.get_string(section, key)?)
    }
}

/// Strip an inline comment and surrounding quotes.
fn clean_value(raw: &str) -> String {
    let mut value = raw.trim();

    if let Some(quoted) = value.strip_prefix('"')
        && let Some(end) = quoted.find('"')
    {
        return quoted[..end].to_string();
    }

    for marker in [" #", "\t#", " ;", "\t;"] {
        if let Some(pos) = value.find(marker) {
            value = value[..pos].trim_end();
        }
    }
    value.to_string()
}

/// Parse a byte size: plain bytes, or a number with a `B`/`KB`/`MB`/`GB`/`TB`
/// suffix (binary multiples, case-insensitive, decimals allowed).
pub fn parse_file_size(value: &str) -> Option<u64> {
    let value = value.trim().to_uppercase();

    if let Ok(bytes) = value.parse::<u64>() {
        return Some(bytes);
    }

    const UNITS: [(&str, u64); 5] = [
        ("TB", 1024 * 1024 * 1024 * 1024),
        ("GB", 1024 * 1024 * 1024),
        ("MB", 1024 * 1024),
        ("KB", 1024),
        ("B", 1),
    ];

    let (number, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mult)| value.strip_suffix(suffix).map(|n| (n.trim(), *mult)))?;

    if let Ok(n) = number.parse::<u64>() {
        return n.checked_mul(multiplier);
    }

    match number.parse::<f64>() {
        Ok(n) if n.is_finite() && n >= 0.0 => Some((n * multiplier as f64) as u64),
        _ => None,
    }
}
