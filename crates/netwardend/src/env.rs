use std::path::{Path, PathBuf};

/// Immutable startup configuration, constructed once in `main` and threaded
/// explicitly into the reconciler and its collaborators. Replaces the
/// ambient globals (`ni_set_global_config_path`, `opt_foreground`, ...) the
/// donor reads from file-scope statics.
#[derive(Debug, Clone)]
pub struct Environment {
    pub config_path: Option<PathBuf>,
    pub root_dir: PathBuf,
    pub foreground: bool,
    pub recover_leases: bool,
    pub debug_facilities: Vec<String>,
}

impl Environment {
    pub fn from_args_and_env(args: &[String]) -> Result<Self, String> {
        let mut config_path = std::env::var_os("NETWARDEND_CONFIG").map(PathBuf::from);
        let mut root_dir = std::env::var_os("NETWARDEND_ROOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        let mut foreground = false;
        let mut recover_leases = true;
        let mut debug_facilities = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {
                    i += 1;
                    let v = args.get(i).ok_or("--config requires an argument")?;
                    config_path = Some(PathBuf::from(v));
                }
                "--root-dir" => {
                    i += 1;
                    let v = args.get(i).ok_or("--root-dir requires an argument")?;
                    root_dir = PathBuf::from(v);
                }
                "--debug" => {
                    i += 1;
                    let v = args.get(i).ok_or("--debug requires an argument")?;
                    debug_facilities.push(v.clone());
                }
                "--foreground" => foreground = true,
                "--no-recovery" => recover_leases = false,
                other => return Err(format!("unrecognized option: {other}")),
            }
            i += 1;
        }

        Ok(Environment {
            config_path,
            root_dir,
            foreground,
            recover_leases,
            debug_facilities,
        })
    }

    pub fn leases_dir(&self) -> PathBuf {
        self.root_dir.join("leases")
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.root_dir.join("requests")
    }

    pub fn policies_dir(&self) -> PathBuf {
        self.root_dir.join("policies")
    }

    pub fn rooted(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            self.root_dir.join(path.strip_prefix("/").unwrap_or(path))
        } else {
            self.root_dir.join(path)
        }
    }
}
