//! Flat `KEY=VALUE` configuration files (`server.properties`, the JVM env
//! file). The server reads these as ISO-8859-1, so all file IO here goes
//! through an explicit latin-1 byte mapping instead of UTF-8.

use std::{fs, path::Path};

#[derive(Debug, thiserror::Error)]
pub enum PropertiesError {
    #[error("Property '{0}' is missing the '='-sign")]
    MissingSeparator(String),
    #[error("Property line contains a character outside latin-1: {0:?}")]
    NotLatin1(char),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Comment(String),
    Pair { key: String, value: String },
}

/// In-memory view of one properties file. Comment lines and key order are
/// kept so a merge rewrites only the keys it names.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    lines: Vec<Line>,
}

impl Properties {
    pub fn parse(text: &str) -> Result<Self, PropertiesError> {
        let mut lines = Vec::new();
        for raw in text.lines() {
            let line = raw.trim_end();
            if line.is_empty() || line.starts_with('#') {
                lines.push(Line::Comment(line.to_string()));
            } else {
                let (key, value) = split_pair(line)?;
                lines.push(Line::Pair { key, value });
            }
        }
        Ok(Self { lines })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Pair { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Replace the value of `key` in place, or append it at the end.
    pub fn set(&mut self, key: &str, value: &str) {
        for line in &mut self.lines {
            if let Line::Pair { key: k, value: v } = line {
                if k == key {
                    *v = value.to_string();
                    return;
                }
            }
        }
        self.lines.push(Line::Pair {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    pub fn merge(&mut self, updates: &[(String, String)]) {
        for (key, value) in updates {
            self.set(key, value);
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Comment(text) => out.push_str(text),
                Line::Pair { key, value } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            Line::Pair { key, .. } => Some(key.as_str()),
            _ => None,
        })
    }
}

fn split_pair(line: &str) -> Result<(String, String), PropertiesError> {
    match line.split_once('=') {
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(PropertiesError::MissingSeparator(line.to_string())),
    }
}

/// Parse CLI-supplied `KEY=VALUE` arguments.
pub fn parse_pairs(pairs: &[String]) -> Result<Vec<(String, String)>, PropertiesError> {
    pairs.iter().map(|pair| split_pair(pair)).collect()
}

pub fn read_file(path: &Path) -> Result<Properties, PropertiesError> {
    let bytes = fs::read(path)?;
    Properties::parse(&decode_latin1(&bytes))
}

pub fn write_file(path: &Path, properties: &Properties) -> Result<(), PropertiesError> {
    fs::write(path, encode_latin1(&properties.render())?)?;
    Ok(())
}

/// Merge `updates` into the file at `path`, creating it if absent. Keys not
/// named in `updates` are left untouched.
pub fn merge_into(path: &Path, updates: &[(String, String)]) -> Result<(), PropertiesError> {
    let mut properties = if path.exists() {
        read_file(path)?
    } else {
        Properties::default()
    };
    properties.merge(updates);
    write_file(path, &properties)
}

pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

pub fn encode_latin1(text: &str) -> Result<Vec<u8>, PropertiesError> {
    text.chars()
        .map(|c| {
            let code = c as u32;
            if code <= 0xFF {
                Ok(code as u8)
            } else {
                Err(PropertiesError::NotLatin1(c))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parse_keeps_comments_and_order() {
        let props = Properties::parse("#header\nmotd=A Server\nserver-port=25565\n").unwrap();
        assert_eq!(props.get("motd"), Some("A Server"));
        assert_eq!(props.get("server-port"), Some("25565"));
        assert_eq!(
            props.render(),
            "#header\nmotd=A Server\nserver-port=25565\n"
        );
    }

    #[test]
    fn parse_rejects_missing_separator() {
        let err = Properties::parse("no-separator\n").unwrap_err();
        assert!(matches!(err, PropertiesError::MissingSeparator(_)));
    }

    #[test]
    fn value_may_contain_separator() {
        let props = Properties::parse("motd=a=b=c\n").unwrap();
        assert_eq!(props.get("motd"), Some("a=b=c"));
    }

    #[test]
    fn merge_preserves_unmentioned_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("server.properties");

        merge_into(&path, &[("a".into(), "1".into())]).unwrap();
        merge_into(&path, &[("b".into(), "2".into())]).unwrap();

        let props = read_file(&path).unwrap();
        assert_eq!(props.get("a"), Some("1"));
        assert_eq!(props.get("b"), Some("2"));
    }

    #[test]
    fn merge_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("server.properties");
        let updates = [("motd".to_string(), "hello".to_string())];

        merge_into(&path, &updates).unwrap();
        let first = fs::read(&path).unwrap();
        merge_into(&path, &updates).unwrap();
        let second = fs::read(&path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn latin1_round_trip() {
        let text = "motd=Caf\u{e9} \u{a7}7welcome\n";
        let encoded = encode_latin1(text).unwrap();
        assert_eq!(encoded.len(), text.chars().count());
        assert_eq!(decode_latin1(&encoded), text);
    }

    #[test]
    fn latin1_rejects_wide_chars() {
        let err = encode_latin1("motd=\u{2764}\n").unwrap_err();
        assert!(matches!(err, PropertiesError::NotLatin1(_)));
    }

    #[test]
    fn parse_pairs_maps_cli_arguments() {
        let pairs = parse_pairs(&["motd=Hi".into(), "max-players=10".into()]).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("motd".to_string(), "Hi".to_string()),
                ("max-players".to_string(), "10".to_string()),
            ]
        );
        assert!(parse_pairs(&["broken".into()]).is_err());
    }
}
