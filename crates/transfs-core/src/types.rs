//! Shared plain types used across the resolver, listing engine, and driver.

use serde::{Deserialize, Serialize};

use crate::error::TransFsError;

/// Presentation policy for archives found inside a mapped directory.
///
/// `Flatten` hides an archive containing exactly one matching member and
/// shows the member in its place; `Hierarchical` always presents the archive
/// as a browsable subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZipMode {
    Flatten,
    #[default]
    Hierarchical,
}

/// One extension spec from a filetype map: either a bare extension (`"UEF"`)
/// or an aliased pair (`"BIN:ROM"`, presenting `.BIN` files as `.ROM`).
///
/// Matching against real file extensions is case-insensitive; the configured
/// spelling is preserved for source-directory names and displayed aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExtensionSpec {
    source: String,
    virt: Option<String>,
}

impl ExtensionSpec {
    /// The source-side extension as configured (e.g. `"BIN"`).
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The virtual extension shown to clients, if aliased.
    pub fn alias(&self) -> Option<&str> {
        self.virt.as_deref()
    }

    /// True when a real file extension matches the source side of this spec.
    pub fn matches(&self, file_ext: &str) -> bool {
        self.source.eq_ignore_ascii_case(file_ext)
    }

    /// The name a matching file is displayed under: the original name for a
    /// bare spec, or `stem.VIRT` for an aliased one.
    pub fn display_name(&self, file_name: &str) -> String {
        match &self.virt {
            Some(virt) => match file_name.rsplit_once('.') {
                Some((stem, _)) => format!("{stem}.{virt}"),
                None => file_name.to_string(),
            },
            None => file_name.to_string(),
        }
    }
}

impl TryFrom<String> for ExtensionSpec {
    type Error = TransFsError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let spec = match raw.split_once(':') {
            Some((src, virt)) => {
                if src.is_empty() || virt.is_empty() || virt.contains(':') {
                    return Err(TransFsError::Config(format!(
                        "invalid extension spec: {raw:?}"
                    )));
                }
                ExtensionSpec {
                    source: src.to_string(),
                    virt: Some(virt.to_string()),
                }
            }
            None => {
                if raw.is_empty() {
                    return Err(TransFsError::Config("empty extension spec".into()));
                }
                ExtensionSpec {
                    source: raw,
                    virt: None,
                }
            }
        };
        if spec.source.contains('.') || spec.source.contains('/') {
            return Err(TransFsError::Config(format!(
                "extension spec must be a bare extension: {:?}",
                spec.source
            )));
        }
        Ok(spec)
    }
}

impl From<ExtensionSpec> for String {
    fn from(spec: ExtensionSpec) -> String {
        match spec.virt {
            Some(virt) => format!("{}:{}", spec.source, virt),
            None => spec.source,
        }
    }
}

/// Extract the extension of a file name (text after the last dot), if any.
pub fn file_extension(name: &str) -> Option<&str> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

/// True for names the virtual tree hides (dotfiles, and members an archive
/// should never expose).
pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(raw: &str) -> ExtensionSpec {
        ExtensionSpec::try_from(raw.to_string()).unwrap()
    }

    #[test]
    fn bare_spec() {
        let s = spec("UEF");
        assert_eq!(s.source(), "UEF");
        assert_eq!(s.alias(), None);
        assert!(s.matches("uef"));
        assert!(s.matches("UEF"));
        assert!(s.matches("Uef"));
        assert!(!s.matches("ssd"));
        assert_eq!(s.display_name("game.uef"), "game.uef");
    }

    #[test]
    fn aliased_spec() {
        let s = spec("BIN:ROM");
        assert_eq!(s.source(), "BIN");
        assert_eq!(s.alias(), Some("ROM"));
        assert!(s.matches("bin"));
        assert_eq!(s.display_name("TEST.BIN"), "TEST.ROM");
    }

    #[test]
    fn invalid_specs_rejected() {
        assert!(ExtensionSpec::try_from("".to_string()).is_err());
        assert!(ExtensionSpec::try_from(":ROM".to_string()).is_err());
        assert!(ExtensionSpec::try_from("BIN:".to_string()).is_err());
        assert!(ExtensionSpec::try_from("A:B:C".to_string()).is_err());
        assert!(ExtensionSpec::try_from("tar.gz".to_string()).is_err());
    }

    #[test]
    fn spec_string_roundtrip() {
        for raw in ["UEF", "BIN:ROM"] {
            let s = spec(raw);
            assert_eq!(String::from(s), raw);
        }
    }

    #[test]
    fn extension_extraction() {
        assert_eq!(file_extension("game.uef"), Some("uef"));
        assert_eq!(file_extension("a.b.ssd"), Some("ssd"));
        assert_eq!(file_extension("noext"), None);
        assert_eq!(file_extension(".hidden"), None);
    }
}
