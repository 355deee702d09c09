//! Configuration model: immutable after load.
//!
//! Two TOML documents are merged at startup: the app document (mountpoint,
//! filestore, cache settings) and the clients document (clients, systems,
//! map entries). A third "sources" document exists in deployments but is
//! consumed only by the external acquisition subsystem; the core never
//! parses it.
//!
//! Unknown fields are ignored. Structural errors fail startup with toml's
//! line-referenced message.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{TransFsError, TransFsResult};
use crate::types::{ExtensionSpec, ZipMode};

/// App document (transfs.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppDoc {
    pub app: AppSettings,
    pub cache: CacheSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Where the virtual tree is mounted
    pub mountpoint: PathBuf,
    /// Physical store root; `Native/` lives directly beneath it
    pub filestore: PathBuf,
    /// On-disk listing cache directory (listing persistence disabled if unset)
    pub cache_dir: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::from("/mnt/transfs"),
            filestore: PathBuf::from("/srv/filestore"),
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// In-memory LRU capacity for directory listings
    pub listing_capacity: u64,
    /// In-memory LRU capacity for archive snapshots
    pub archive_capacity: u64,
    /// TTL in seconds for negative resolution entries
    pub negative_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            listing_capacity: 1024,
            archive_capacity: 64,
            negative_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Clients document (clients.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientsDoc {
    pub clients: Vec<Client>,
}

/// A named downstream consumer of the virtual tree (an emulator front-end).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub name: String,
    /// Optional target-path template used by deployment tooling; the core
    /// carries it but does not interpret it.
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub systems: Vec<System>,
}

impl Client {
    pub fn system(&self, name: &str) -> Option<&System> {
        self.systems.iter().find(|s| s.name == name)
    }
}

/// One emulated platform under a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct System {
    /// Virtual directory name under the client
    pub name: String,
    pub manufacturer: String,
    /// Canonical system name in the physical store
    pub system: String,
    /// Path relative to `filestore/Native/`
    pub base_path: String,
    #[serde(default)]
    pub maps: Vec<MapEntry>,
}

/// One rule describing how virtual children of a system are produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapEntry {
    /// Virtual directory bound to a relative source directory; subpath
    /// traversal is passthrough.
    Static { name: String, source_dir: String },

    /// Virtual filename bound to a physical file, optionally exposing
    /// enumerated members of an archive source.
    DefaultSource {
        name: String,
        source: String,
        #[serde(default)]
        files: BTreeMap<String, MemberRule>,
    },

    /// Macro entry expanding to one virtual folder per filetype map row.
    SoftwareArchives {
        source_dir: String,
        #[serde(default)]
        supports_zip: bool,
        #[serde(default)]
        zip_mode: ZipMode,
        #[serde(default)]
        filetypes: Vec<FileTypeFolder>,
    },

    /// Virtual directory bound to one physical directory with optional zip
    /// settings.
    DirectMount {
        name: String,
        path: String,
        #[serde(default)]
        supports_zip: bool,
        #[serde(default)]
        zip_mode: ZipMode,
    },
}

/// Per-member traversal hint on a default-source entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberRule {
    pub zip: Option<ZipRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZipRule {
    Unzip,
}

/// One row of a filetype map: a virtual folder name plus the extension specs
/// whose files populate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTypeFolder {
    pub folder: String,
    pub extensions: Vec<ExtensionSpec>,
}

/// A named top-level virtual child of a system, as produced by its map
/// entries. Dynamic entries expand to one target per filetype folder;
/// default-source entries with enumerated members expand to one target per
/// member name.
#[derive(Debug, Clone, Copy)]
pub enum MapTarget<'a> {
    Static {
        source_dir: &'a str,
    },
    DefaultSource {
        source: &'a str,
        /// Set when the virtual name is an enumerated member of the source
        member: Option<(&'a str, &'a MemberRule)>,
    },
    DynamicFolder {
        source_dir: &'a str,
        supports_zip: bool,
        zip_mode: ZipMode,
        folder: &'a FileTypeFolder,
    },
    DirectMount {
        path: &'a str,
        supports_zip: bool,
        zip_mode: ZipMode,
    },
}

impl System {
    /// All top-level virtual names this system exposes, with what each maps
    /// to. Order follows the configured map entry order.
    pub fn map_targets(&self) -> Vec<(&str, MapTarget<'_>)> {
        let mut out = Vec::new();
        for entry in &self.maps {
            match entry {
                MapEntry::Static { name, source_dir } => {
                    out.push((name.as_str(), MapTarget::Static { source_dir }));
                }
                MapEntry::DefaultSource {
                    name,
                    source,
                    files,
                } => {
                    if files.is_empty() {
                        out.push((
                            name.as_str(),
                            MapTarget::DefaultSource {
                                source,
                                member: None,
                            },
                        ));
                    } else {
                        for (member, rule) in files {
                            out.push((
                                member.as_str(),
                                MapTarget::DefaultSource {
                                    source,
                                    member: Some((member.as_str(), rule)),
                                },
                            ));
                        }
                    }
                }
                MapEntry::SoftwareArchives {
                    source_dir,
                    supports_zip,
                    zip_mode,
                    filetypes,
                } => {
                    for folder in filetypes {
                        out.push((
                            folder.folder.as_str(),
                            MapTarget::DynamicFolder {
                                source_dir,
                                supports_zip: *supports_zip,
                                zip_mode: *zip_mode,
                                folder,
                            },
                        ));
                    }
                }
                MapEntry::DirectMount {
                    name,
                    path,
                    supports_zip,
                    zip_mode,
                } => {
                    out.push((
                        name.as_str(),
                        MapTarget::DirectMount {
                            path,
                            supports_zip: *supports_zip,
                            zip_mode: *zip_mode,
                        },
                    ));
                }
            }
        }
        out
    }

    /// Resolve one top-level virtual name. Folder names are matched
    /// case-sensitively.
    pub fn map_target(&self, name: &str) -> Option<MapTarget<'_>> {
        self.map_targets()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| t)
    }

    /// This system's physical root: `{filestore}/Native/{base_path}`.
    pub fn native_root(&self, filestore: &Path) -> PathBuf {
        filestore.join("Native").join(&self.base_path)
    }
}

/// The merged, validated configuration. Owned by the `Core`, shared by
/// reference everywhere else.
#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppSettings,
    pub cache: CacheSettings,
    pub log: LogSettings,
    pub clients: Vec<Client>,
}

impl Config {
    /// Parse and merge the two config documents, then validate.
    pub fn from_toml(app_toml: &str, clients_toml: &str) -> TransFsResult<Config> {
        let app: AppDoc = toml::from_str(app_toml)
            .map_err(|e| TransFsError::Config(format!("app config: {e}")))?;
        let clients: ClientsDoc = toml::from_str(clients_toml)
            .map_err(|e| TransFsError::Config(format!("clients config: {e}")))?;

        let config = Config {
            app: app.app,
            cache: app.cache,
            log: app.log,
            clients: clients.clients,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn client(&self, name: &str) -> Option<&Client> {
        self.clients.iter().find(|c| c.name == name)
    }

    /// Enforce the model invariants: unique client and system names, unique
    /// top-level virtual names per system (case-insensitively, after dynamic
    /// expansion), and single-level extension aliases.
    fn validate(&self) -> TransFsResult<()> {
        let mut client_names = HashSet::new();
        for client in &self.clients {
            if !client_names.insert(client.name.clone()) {
                return Err(TransFsError::Config(format!(
                    "duplicate client name: {:?}",
                    client.name
                )));
            }
            let mut system_names = HashSet::new();
            for system in &client.systems {
                if !system_names.insert(system.name.clone()) {
                    return Err(TransFsError::Config(format!(
                        "duplicate system {:?} under client {:?}",
                        system.name, client.name
                    )));
                }
                system.validate(&client.name)?;
            }
        }
        Ok(())
    }
}

/// Reject configured relative paths that could escape the system root.
fn validate_rel_path(ctx: &str, field: &str, value: &str) -> TransFsResult<()> {
    let escapes = value.starts_with('/') || value.split('/').any(|c| c == "..");
    if escapes {
        return Err(TransFsError::Config(format!(
            "{ctx}: {field} {value:?} must be relative and stay inside the system root"
        )));
    }
    Ok(())
}

impl System {
    fn validate(&self, client: &str) -> TransFsResult<()> {
        let ctx = format!("{client}/{}", self.name);
        validate_rel_path(&ctx, "base_path", &self.base_path)?;
        for entry in &self.maps {
            match entry {
                MapEntry::Static { source_dir, .. } => {
                    validate_rel_path(&ctx, "source_dir", source_dir)?;
                }
                MapEntry::DefaultSource { source, files, .. } => {
                    validate_rel_path(&ctx, "source", source)?;
                    for member in files.keys() {
                        validate_rel_path(&ctx, "member", member)?;
                    }
                }
                MapEntry::SoftwareArchives { source_dir, .. } => {
                    validate_rel_path(&ctx, "source_dir", source_dir)?;
                }
                MapEntry::DirectMount { path, .. } => {
                    validate_rel_path(&ctx, "path", path)?;
                }
            }
        }

        let mut seen = HashSet::new();
        for (name, _) in self.map_targets() {
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(TransFsError::Config(format!(
                    "duplicate virtual name {name:?} in {client}/{}",
                    self.name
                )));
            }
        }

        for entry in &self.maps {
            if let MapEntry::SoftwareArchives { filetypes, .. } = entry {
                for folder in filetypes {
                    if folder.extensions.is_empty() {
                        return Err(TransFsError::Config(format!(
                            "empty extension list for folder {:?} in {client}/{}",
                            folder.folder, self.name
                        )));
                    }
                    // Aliases are single-level: an alias target must not be
                    // the source side of another spec in the same folder.
                    for spec in &folder.extensions {
                        if let Some(virt) = spec.alias() {
                            let chained = folder.extensions.iter().any(|other| {
                                other.alias().is_some() && other.matches(virt)
                            });
                            if chained {
                                return Err(TransFsError::Config(format!(
                                    "chained extension alias via {virt:?} in folder {:?} of {client}/{}",
                                    folder.folder, self.name
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = r#"
[app]
mountpoint = "/mnt/roms"
filestore = "/srv/filestore"
cache_dir = "/var/cache/transfs"

[cache]
listing_capacity = 256

[log]
level = "debug"
"#;

    const CLIENTS: &str = r#"
[[clients]]
name = "MiSTer"

[[clients.systems]]
name = "AcornElectron"
manufacturer = "Acorn"
system = "Electron"
base_path = "Acorn/Electron"

  [[clients.systems.maps]]
  type = "static"
  name = "HDs"
  source_dir = "Software/HDs"

  [[clients.systems.maps]]
  type = "default_source"
  name = "boot.vhd"
  source = "BIOS/boot.zip"
    [clients.systems.maps.files."boot.vhd"]
    zip = "unzip"

  [[clients.systems.maps]]
  type = "software_archives"
  source_dir = "Software"
  supports_zip = true
  zip_mode = "flatten"
    [[clients.systems.maps.filetypes]]
    folder = "Tapes"
    extensions = ["UEF"]
    [[clients.systems.maps.filetypes]]
    folder = "ROMs"
    extensions = ["BIN:ROM"]
"#;

    #[test]
    fn parse_and_merge() {
        let config = Config::from_toml(APP, CLIENTS).unwrap();
        assert_eq!(config.app.mountpoint, PathBuf::from("/mnt/roms"));
        assert_eq!(config.cache.listing_capacity, 256);
        // defaults fill unlisted fields
        assert_eq!(config.cache.archive_capacity, 64);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, "text");

        let client = config.client("MiSTer").unwrap();
        let system = client.system("AcornElectron").unwrap();
        assert_eq!(system.manufacturer, "Acorn");
        assert_eq!(
            system.native_root(Path::new("/srv/filestore")),
            PathBuf::from("/srv/filestore/Native/Acorn/Electron")
        );
    }

    #[test]
    fn map_targets_expand_dynamic_and_members() {
        let config = Config::from_toml(APP, CLIENTS).unwrap();
        let system = config.client("MiSTer").unwrap().system("AcornElectron").unwrap();

        let names: Vec<&str> = system.map_targets().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["HDs", "boot.vhd", "Tapes", "ROMs"]);

        match system.map_target("Tapes").unwrap() {
            MapTarget::DynamicFolder {
                source_dir,
                supports_zip,
                zip_mode,
                folder,
            } => {
                assert_eq!(source_dir, "Software");
                assert!(supports_zip);
                assert_eq!(zip_mode, ZipMode::Flatten);
                assert_eq!(folder.extensions.len(), 1);
            }
            other => panic!("unexpected target: {other:?}"),
        }

        match system.map_target("boot.vhd").unwrap() {
            MapTarget::DefaultSource { source, member } => {
                assert_eq!(source, "BIOS/boot.zip");
                let (name, rule) = member.unwrap();
                assert_eq!(name, "boot.vhd");
                assert_eq!(rule.zip, Some(ZipRule::Unzip));
            }
            other => panic!("unexpected target: {other:?}"),
        }
    }

    #[test]
    fn name_matching_is_case_sensitive() {
        let config = Config::from_toml(APP, CLIENTS).unwrap();
        let system = config.client("MiSTer").unwrap().system("AcornElectron").unwrap();
        assert!(system.map_target("tapes").is_none());
        assert!(system.map_target("Tapes").is_some());
    }

    #[test]
    fn unknown_fields_ignored() {
        let clients = r#"
[[clients]]
name = "MiSTer"
frobnicate = true
"#;
        assert!(Config::from_toml("", clients).is_ok());
    }

    #[test]
    fn duplicate_virtual_name_rejected() {
        let clients = r#"
[[clients]]
name = "MiSTer"

[[clients.systems]]
name = "BBCMicro"
manufacturer = "Acorn"
system = "BBC Micro"
base_path = "Acorn/BBCMicro"

  [[clients.systems.maps]]
  type = "static"
  name = "Tapes"
  source_dir = "Software/Tapes"

  [[clients.systems.maps]]
  type = "software_archives"
  source_dir = "Software"
    [[clients.systems.maps.filetypes]]
    folder = "tapes"
    extensions = ["UEF"]
"#;
        let err = Config::from_toml("", clients).unwrap_err();
        assert!(err.to_string().contains("duplicate virtual name"));
    }

    #[test]
    fn chained_alias_rejected() {
        let clients = r#"
[[clients]]
name = "MiSTer"

[[clients.systems]]
name = "BBCMicro"
manufacturer = "Acorn"
system = "BBC Micro"
base_path = "Acorn/BBCMicro"

  [[clients.systems.maps]]
  type = "software_archives"
  source_dir = "Software"
    [[clients.systems.maps.filetypes]]
    folder = "Disks"
    extensions = ["SSD:DSD", "DSD:ADF"]
"#;
        let err = Config::from_toml("", clients).unwrap_err();
        assert!(err.to_string().contains("chained extension alias"));
    }

    #[test]
    fn escaping_source_dir_rejected() {
        let clients = r#"
[[clients]]
name = "MiSTer"

[[clients.systems]]
name = "BBCMicro"
manufacturer = "Acorn"
system = "BBC Micro"
base_path = "Acorn/BBCMicro"

  [[clients.systems.maps]]
  type = "static"
  name = "HDs"
  source_dir = "../../../etc"
"#;
        let err = Config::from_toml("", clients).unwrap_err();
        assert!(err.to_string().contains("stay inside the system root"));
    }

    #[test]
    fn structural_error_is_line_referenced() {
        let err = Config::from_toml("", "[[clients]]\nsystems = 3\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line"), "no line reference in: {msg}");
    }
}
