//! Mount CLI surface (spec.md §6), grounded in `brfs::main`'s argument set
//! for which flags exist and how `--debug` cascades into other flags, with
//! the derive-based structure and grouped option structs (`vitte-cli`'s
//! `#[command(flatten)]` groups) used in place of `brfs`'s older builder
//! API, since both are clap 4.
//!
//! `-o k=v[,k=v]` parsing and the `--login-method` fan-out follow
//! `studip_fuse/launcher/cmd_util.py`'s `parse_args` directly: `--debug`
//! turns on `--debug-logging`/`--debug-fuse`/`--debug-aio` together, and an
//! unset `--oauth-client-key` means "use the instance's own default", not a
//! missing flag.

use crate::catalog::auth::Credentials;
use crate::encode::{Charset, Mode};
use crate::error::{CampusFsError, Result};
use clap::{Parser, ValueEnum};
use fuser::MountOption;
use std::io::Read;
use std::path::{Path, PathBuf};

pub const DEFAULT_FORMAT: &str =
    "{semester-lexical}/{class}/{course}/{type-abbrev}/{short-path}/{name}";
const DEFAULT_STUDIP_URL: &str = "https://studip.uni-passau.de/studip/api.php/";
const DEFAULT_SHIB_URL: &str =
    "https://studip.uni-passau.de/studip/index.php?again=yes&sso=shib";

/// Name/path escaping is fixed rather than user-configurable, matching the
/// reference client's own hardcoded `Charset.Ascii, EscapeMode.Similar`
/// fallback (`studip_fuse/path/virtual_path.py`).
pub const CHARSET: Charset = Charset::Ascii;
pub const ESCAPE_MODE: Mode = Mode::Similar;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LoginMethod {
    Shib,
    Oauth,
    Basic,
}

#[derive(Parser, Debug)]
#[command(name = "campusfs", version, about = "Mount a remote course-management server as a read-only filesystem.")]
pub struct Cli {
    /// Username on the remote server.
    pub user: String,

    /// Path to mount the filesystem at.
    pub mount: PathBuf,

    #[command(flatten)]
    pub studip: StudipOpts,

    #[command(flatten)]
    pub auth: AuthOpts,

    #[command(flatten)]
    pub fuse: FuseOpts,

    /// Turn on all debugging options.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Turn on debug logging.
    #[arg(short = 'v', long)]
    pub debug_logging: bool,

    /// Turn on scheduler-loop trace logging.
    #[arg(long)]
    pub debug_aio: bool,

    /// FUSE-like `-o k=v[,k=v]` mount options.
    #[arg(short = 'o', value_delimiter = ',')]
    pub mount_options: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub struct StudipOpts {
    /// Format specifier for virtual paths.
    #[arg(long, default_value = DEFAULT_FORMAT)]
    pub format: String,

    /// Path to cache directory.
    #[arg(long, alias = "cache")]
    pub cache_dir: Option<PathBuf>,

    /// Remote API base URL.
    #[arg(long, alias = "studip", default_value = DEFAULT_STUDIP_URL)]
    pub studip_url: String,
}

#[derive(clap::Args, Debug)]
pub struct AuthOpts {
    /// Method for logging in to the remote session.
    #[arg(long, value_enum, default_value_t = LoginMethod::Oauth)]
    pub login_method: LoginMethod,

    /// Path to password file, or `-` to read from stdin (`basic`/`shib`).
    #[arg(long)]
    pub pwfile: Option<PathBuf>,

    /// Remote SSO URL.
    #[arg(long, alias = "sso", default_value = DEFAULT_SHIB_URL)]
    pub shib_url: String,

    /// Path to a JSON file containing OAuth client key and secret; unset
    /// means use the instance's own default client registration.
    #[arg(long)]
    pub oauth_client_key: Option<PathBuf>,

    /// Path to the file session keys are read from/stored to.
    #[arg(long)]
    pub oauth_session_token: Option<PathBuf>,

    /// Disable interactive OAuth login when no valid session token exists.
    #[arg(long)]
    pub oauth_no_login: bool,

    /// Don't open a browser during interactive OAuth login.
    #[arg(long)]
    pub oauth_no_browser: bool,

    /// Don't persist the session token obtained after logging in.
    #[arg(long)]
    pub oauth_no_store: bool,
}

#[derive(clap::Args, Debug)]
pub struct FuseOpts {
    #[arg(short = 'f', long)]
    pub foreground: bool,

    #[arg(short = 's', long)]
    pub nothreads: bool,

    #[arg(long)]
    pub allow_other: bool,

    #[arg(long)]
    pub allow_root: bool,

    #[arg(long)]
    pub nonempty: bool,

    #[arg(long)]
    pub umask: Option<String>,

    #[arg(long)]
    pub uid: Option<u32>,

    #[arg(long)]
    pub gid: Option<u32>,

    #[arg(long)]
    pub default_permissions: bool,

    /// Enable FUSE debug mode (implies `--foreground`).
    #[arg(long)]
    pub debug_fuse: bool,
}

#[derive(Debug, PartialEq, Eq, Clone)]
struct OAuthClientKey {
    client_key: String,
    client_secret: String,
}

impl Cli {
    /// `--debug` cascades into the three finer-grained debug flags, same as
    /// `cmd_util.py`'s post-processing of `args.debug`.
    pub fn effective_debug_logging(&self) -> bool {
        self.debug || self.debug_logging
    }

    pub fn effective_debug_fuse(&self) -> bool {
        self.debug || self.fuse.debug_fuse
    }

    pub fn effective_debug_aio(&self) -> bool {
        self.debug || self.debug_aio
    }

    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.studip
            .cache_dir
            .clone()
            .or_else(|| dirs_next::cache_dir().map(|d| d.join("campusfs")))
            .unwrap_or_else(|| PathBuf::from(".campusfs-cache"))
    }

    /// Parses `-o k=v[,k=v]` into `fuser::MountOption`s plus the dedicated
    /// flags above, rejecting `rw` since this mount is always read-only
    /// (spec.md §6).
    pub fn fuse_mount_options(&self) -> Result<Vec<MountOption>> {
        let mut options = Vec::new();
        if self.fuse.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.fuse.allow_root {
            options.push(MountOption::AllowRoot);
        }
        if self.fuse.default_permissions {
            options.push(MountOption::DefaultPermissions);
        }
        for raw in &self.mount_options {
            for entry in raw.split(',').filter(|s| !s.is_empty()) {
                match entry.split_once('=') {
                    Some((k, v)) => options.push(custom_kv_option(k, v)?),
                    None => options.push(bare_option(entry)?),
                }
            }
        }
        Ok(options)
    }

    /// Reads the password from `--pwfile` (`-` means stdin), required for
    /// `basic`/`shib` login methods.
    fn read_password(&self) -> Result<String> {
        let Some(path) = &self.auth.pwfile else {
            return Err(CampusFsError::Auth("--pwfile is required for this login method".into()));
        };
        let raw = if path.as_os_str() == "-" {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(CampusFsError::Io)?;
            buf
        } else {
            std::fs::read_to_string(path).map_err(CampusFsError::Io)?
        };
        Ok(raw.trim_end_matches(['\n', '\r']).to_string())
    }

    fn read_oauth_client_key(&self) -> Result<Option<OAuthClientKey>> {
        let Some(path) = &self.auth.oauth_client_key else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path).map_err(CampusFsError::Io)?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| CampusFsError::Protocol(format!("invalid OAuth client key file {path:?}: {e}")))?;
        let client_key = value["client_key"]
            .as_str()
            .ok_or_else(|| CampusFsError::Protocol("OAuth client key file missing client_key".into()))?
            .to_string();
        let client_secret = value["client_secret"]
            .as_str()
            .ok_or_else(|| CampusFsError::Protocol("OAuth client key file missing client_secret".into()))?
            .to_string();
        Ok(Some(OAuthClientKey { client_key, client_secret }))
    }

    /// Builds the `Credentials` for whichever `--login-method` was chosen
    /// (spec.md §4.4), reading whatever files that method requires.
    pub fn credentials(&self) -> Result<Credentials> {
        match self.auth.login_method {
            LoginMethod::Basic => Ok(Credentials::Basic {
                username: self.user.clone(),
                password: self.read_password()?,
            }),
            LoginMethod::Shib => Ok(Credentials::Form {
                shib_url: self.auth.shib_url.clone(),
                username: self.user.clone(),
                password: self.read_password()?,
            }),
            LoginMethod::Oauth => {
                let key = self.read_oauth_client_key()?.ok_or_else(|| {
                    CampusFsError::Auth(
                        "--oauth-client-key is required: no built-in default client registration".into(),
                    )
                })?;
                Ok(Credentials::OAuth1 {
                    client_key: key.client_key,
                    client_secret: key.client_secret,
                    session_token_file: self.auth.oauth_session_token.clone(),
                    no_login: self.auth.oauth_no_login,
                    no_browser: self.auth.oauth_no_browser,
                    no_store: self.auth.oauth_no_store,
                })
            }
        }
    }
}

fn bare_option(name: &str) -> Result<MountOption> {
    match name {
        "rw" => Err(CampusFsError::Protocol("-o rw is rejected: this mount is always read-only".into())),
        "ro" => Ok(MountOption::RO),
        "suid" => Ok(MountOption::Suid),
        "nosuid" => Ok(MountOption::NoSuid),
        "dev" => Ok(MountOption::Dev),
        "nodev" => Ok(MountOption::NoDev),
        "exec" => Ok(MountOption::Exec),
        "noexec" => Ok(MountOption::NoExec),
        other => Err(CampusFsError::Protocol(format!("unrecognized mount option '{other}'"))),
    }
}

fn custom_kv_option(key: &str, value: &str) -> Result<MountOption> {
    match key {
        "fsname" => Ok(MountOption::FSName(value.to_string())),
        "subtype" => Ok(MountOption::Subtype(value.to_string())),
        other => Err(CampusFsError::Protocol(format!("unrecognized mount option '{other}={value}'"))),
    }
}

pub fn normalize_mount_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
