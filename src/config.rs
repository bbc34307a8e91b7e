//-
// Copyright (c) 2016, Jason Lingle
//
// This file is part of Metanode.
//
// Metanode is free software: you can redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Metanode is distributed  in the hope that it will be useful,  but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Metanode. If not, see <http://www.gnu.org/licenses/>.

use std::env;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::result::Result as StdResult;
use std::str::FromStr;

use toml;

use crate::errors::*;
use crate::select::SelectorPolicy;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Ten hours, the conventional default for both the key update interval and
/// the token lifetime.
const DEFAULT_KEY_MS: i64 = 10 * 60 * 60 * 1000;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Which storage backend holds the shared namespace.
    pub storage: StorageBackend,
    /// Whether to wipe and re-bootstrap the persisted layout on startup.
    pub format_storage: bool,
    /// Milliseconds between block-key rotations on the leader.
    pub key_update_interval: i64,
    /// Milliseconds an issued block token stays valid.
    pub token_lifetime: i64,
    /// How clients pick among namenode endpoints.
    pub selector_policy: SelectorPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    /// The in-memory store; nothing survives the process.
    Memory,
    /// The embedded store rooted at the given directory.
    Path(String),
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> StdResult<Self, String> {
        if "memory" == s {
            return Ok(StorageBackend::Memory);
        }

        let colon = s.find(':').ok_or_else(|| {
            format!(
                "Invalid storage backend '{}'; syntax is `memory` or \
                 `path:/some/dir`",
                s
            )
        })?;

        let typ = &s[..colon];
        let value = &s[colon + 1..];
        match typ {
            "path" => Ok(StorageBackend::Path(value.to_owned())),
            _ => Err(format!("Invalid storage backend type '{}'", typ)),
        }
    }
}

impl Config {
    /// Transform the given path (e.g., provided by the user) into the actual
    /// path for the configuration file.
    pub fn file_location<P: AsRef<Path>>(given: P) -> Result<PathBuf> {
        let mut filename = given.as_ref().to_owned();
        if !filename.ends_with(CONFIG_FILE_NAME) {
            filename.push(CONFIG_FILE_NAME);
        }

        if filename.is_relative() {
            let mut cwd = env::current_dir()
                .chain_err(|| "Failed to determine current directory")?;
            cwd.push(&filename);
            filename = cwd;
        }

        Ok(filename)
    }

    /// Loads the configuration from the given path. The path is implicitly
    /// passed through `file_location` so that this function can tolerate
    /// relative paths and references to the whole directory instead of the
    /// configuration itself.
    pub fn read<P: AsRef<Path>>(filename: P) -> Result<Self> {
        let filename = Self::file_location(filename)?;

        let mut text = String::new();
        fs::File::open(&filename)
            .and_then(|mut file| file.read_to_string(&mut text))
            .map_err(|e| format!("{}: {}", filename.display(), e))?;

        Self::parse(&filename, &text)
    }

    /// Parses the configuration in `s`. `filename` is used only for error
    /// messages.
    pub fn parse<P: AsRef<Path>>(filename: P, s: &str) -> Result<Self> {
        let filename = filename.as_ref();

        let root: toml::Value = s.parse().map_err(|e| {
            format!("{}: Syntax error: {}", filename.display(), e)
        })?;
        let table = root.as_table().ok_or_else(|| {
            format!("{}: Top level is not a table", filename.display())
        })?;

        macro_rules! extract {
            ($from:expr, $section:expr, $key:ident, $convert:ident,
             $convert_name:expr) => {
                $from
                    .get(stringify!($key))
                    .map(|v| {
                        v.$convert().ok_or_else(|| {
                            Error::from(format!(
                                "{}: Key '{}' under {} must be {}",
                                filename.display(),
                                stringify!($key),
                                $section,
                                $convert_name
                            ))
                        })
                    })
                    .transpose()
            };
        }

        let storage = table
            .get("storage")
            .and_then(|v| v.as_table())
            .ok_or_else(|| {
                format!("{}: Missing section [storage]", filename.display())
            })?;

        let backend = extract!(storage, "[storage]", backend, as_str,
                               "a string")?
            .ok_or_else(|| {
                format!(
                    "{}: Missing key \"backend\" under [storage]",
                    filename.display()
                )
            })?
            .parse()
            .map_err(|e| format!("{}: {}", filename.display(), e))?;
        let format_storage = extract!(storage, "[storage]", format, as_bool,
                                      "a boolean")?
            .unwrap_or(false);

        let empty = toml::value::Table::new();
        let tokens = table
            .get("block_tokens")
            .and_then(|v| v.as_table())
            .unwrap_or(&empty);
        let key_update_interval = extract!(
            tokens,
            "[block_tokens]",
            key_update_interval_ms,
            as_integer,
            "an integer"
        )?
        .unwrap_or(DEFAULT_KEY_MS);
        let token_lifetime = extract!(
            tokens,
            "[block_tokens]",
            token_lifetime_ms,
            as_integer,
            "an integer"
        )?
        .unwrap_or(DEFAULT_KEY_MS);
        if key_update_interval <= 0 || token_lifetime <= 0 {
            bail!(format!(
                "{}: Key intervals must be positive",
                filename.display()
            ));
        }

        let client = table
            .get("client")
            .and_then(|v| v.as_table())
            .unwrap_or(&empty);
        // An unknown policy name silently becomes the default; a bad name
        // must not keep a namenode from starting.
        let selector_policy = extract!(client, "[client]", selector_policy,
                                       as_str, "a string")?
            .map(SelectorPolicy::parse)
            .unwrap_or_default();

        Ok(Config {
            storage: backend,
            format_storage,
            key_update_interval,
            token_lifetime,
            selector_policy,
        })
    }
}
