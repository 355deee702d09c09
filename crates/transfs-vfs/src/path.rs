//! Virtual path parser: splits an absolute virtual path into
//! `(client, system, map target, subpath)`.

use transfs_core::config::{Client, Config, MapTarget, System};
use transfs_core::{TransFsError, TransFsResult};

/// A parsed virtual path. Borrowed parts point into the configuration,
/// which outlives every request.
#[derive(Debug)]
pub enum ParsedPath<'c> {
    Root,
    Client {
        client: &'c Client,
    },
    System {
        client: &'c Client,
        system: &'c System,
    },
    InSystem {
        client: &'c Client,
        system: &'c System,
        entry_name: String,
        target: MapTarget<'c>,
        subpath: Vec<String>,
    },
}

/// Split `vpath` on `/` and resolve the leading segments against the
/// configuration. Client and system names match exactly; so does the
/// map-entry segment (case-sensitive). Unknown names are `NotFound`.
pub fn parse<'c>(config: &'c Config, vpath: &str) -> TransFsResult<ParsedPath<'c>> {
    let mut segments = Vec::new();
    for seg in vpath.split('/') {
        if seg.is_empty() {
            continue;
        }
        // Traversal and hidden components never resolve. `.` and `..` are
        // covered by the dot prefix check.
        if seg.starts_with('.') || seg.contains('\0') {
            return Err(TransFsError::NotFound);
        }
        segments.push(seg);
    }

    let mut iter = segments.into_iter();

    let client_name = match iter.next() {
        Some(name) => name,
        None => return Ok(ParsedPath::Root),
    };
    let client = config.client(client_name).ok_or(TransFsError::NotFound)?;

    let system_name = match iter.next() {
        Some(name) => name,
        None => return Ok(ParsedPath::Client { client }),
    };
    let system = client.system(system_name).ok_or(TransFsError::NotFound)?;

    let entry_name = match iter.next() {
        Some(name) => name,
        None => return Ok(ParsedPath::System { client, system }),
    };
    let target = system.map_target(entry_name).ok_or(TransFsError::NotFound)?;

    Ok(ParsedPath::InSystem {
        client,
        system,
        entry_name: entry_name.to_string(),
        target,
        subpath: iter.map(str::to_string).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> Config {
        let clients = r#"
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
  type = "software_archives"
  source_dir = "Software"
    [[clients.systems.maps.filetypes]]
    folder = "Tapes"
    extensions = ["UEF"]
"#;
        Config::from_toml("", clients).unwrap()
    }

    #[test]
    fn parses_each_depth() {
        let config = config();

        assert!(matches!(parse(&config, "/"), Ok(ParsedPath::Root)));
        assert!(matches!(
            parse(&config, "/MiSTer"),
            Ok(ParsedPath::Client { .. })
        ));
        assert!(matches!(
            parse(&config, "/MiSTer/AcornElectron"),
            Ok(ParsedPath::System { .. })
        ));

        match parse(&config, "/MiSTer/AcornElectron/Tapes/sub/game.uef").unwrap() {
            ParsedPath::InSystem {
                entry_name,
                subpath,
                ..
            } => {
                assert_eq!(entry_name, "Tapes");
                assert_eq!(subpath, ["sub", "game.uef"]);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn empty_segments_collapse() {
        let config = config();
        assert!(matches!(
            parse(&config, "//MiSTer///AcornElectron/"),
            Ok(ParsedPath::System { .. })
        ));
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        let config = config();
        for vpath in [
            "/Nope",
            "/MiSTer/Spectrum",
            "/MiSTer/AcornElectron/Nope",
            "/MiSTer/AcornElectron/tapes", // entry match is case-sensitive
        ] {
            assert!(
                matches!(parse(&config, vpath), Err(TransFsError::NotFound)),
                "{vpath} should not resolve"
            );
        }
    }

    #[test]
    fn traversal_components_rejected() {
        let config = config();
        for vpath in [
            "/MiSTer/AcornElectron/HDs/../../../etc/passwd",
            "/MiSTer/AcornElectron/HDs/./x",
            "/MiSTer/AcornElectron/.hidden",
        ] {
            assert!(matches!(parse(&config, vpath), Err(TransFsError::NotFound)));
        }
    }

    proptest! {
        /// No input may panic the parser, and anything containing a `..`
        /// component never resolves.
        #[test]
        fn parser_is_total(vpath in "[a-zA-Z0-9./_-]{0,64}") {
            let config = config();
            let parsed = parse(&config, &vpath);
            let has_dotdot = vpath.split('/').any(|c| c == "..");
            if has_dotdot {
                prop_assert!(parsed.is_err());
            }
        }
    }
}
