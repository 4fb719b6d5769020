//! Directory Tree Resolver
//!
//! Turns the six layout settings into absolute roots and the pure conversions
//! between a route directory, its endpoint and its build artifacts. Nothing
//! here touches the file system.

use std::path::{Component, Path, PathBuf};

use crate::errors::ConfigError;

/// Layout settings, exactly as configured.
#[derive(Debug, Clone)]
pub struct TreeSettings {
    pub root: PathBuf,
    pub routes_directory: String,
    pub entry_file_name: String,
    pub build_output_directory_name: String,
    pub compiled_handler_file_name: String,
    pub upload_subdirectory_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTree {
    root: PathBuf,
    routes_root: PathBuf,
    build_root: PathBuf,
    entry_file_name: String,
    compiled_handler_file_name: String,
    upload_subdirectory_name: String,
}

impl ResolvedTree {
    pub fn resolve(settings: &TreeSettings) -> Result<Self, ConfigError> {
        if !settings.root.is_absolute() {
            return Err(ConfigError::RelativeRoot(settings.root.clone()));
        }
        let root = normalize(&settings.root);

        let routes = relative_inside("routesDirectory", &settings.routes_directory, true)?;
        let build = relative_inside(
            "buildOutputDirectoryName",
            &settings.build_output_directory_name,
            false,
        )?;

        Ok(Self {
            routes_root: root.join(routes),
            build_root: root.join(build),
            root,
            entry_file_name: plain_file_name("entryFileName", &settings.entry_file_name)?,
            compiled_handler_file_name: plain_file_name(
                "compiledHandlerFileName",
                &settings.compiled_handler_file_name,
            )?,
            upload_subdirectory_name: plain_file_name(
                "uploadSubdirectoryName",
                &settings.upload_subdirectory_name,
            )?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn routes_root(&self) -> &Path {
        &self.routes_root
    }

    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    pub fn entry_file_name(&self) -> &str {
        &self.entry_file_name
    }

    pub fn compiled_handler_file_name(&self) -> &str {
        &self.compiled_handler_file_name
    }

    /// Compiled handler file name without its extension: the compiler's module name.
    pub fn output_name(&self) -> &str {
        Path::new(&self.compiled_handler_file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.compiled_handler_file_name)
    }

    pub fn entry_point(&self, dir: &Path) -> PathBuf {
        normalize(dir).join(&self.entry_file_name)
    }

    pub fn directory_to_endpoint(&self, dir: &Path) -> Result<String, ConfigError> {
        let segments = self.segments(dir)?;
        Ok(format!("/{}", segments.join("/")))
    }

    /// Inverse of [`Self::directory_to_endpoint`].
    pub fn endpoint_to_directory(&self, endpoint: &str) -> Result<PathBuf, ConfigError> {
        let mut dir = self.routes_root.clone();
        for segment in endpoint.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(ConfigError::OutsideRoutes(dir.join(segment)));
            }
            dir.push(segment);
        }
        Ok(dir)
    }

    pub fn directory_to_build_output_directory(&self, dir: &Path) -> Result<PathBuf, ConfigError> {
        let segments = self.segments(dir)?;
        Ok(segments.iter().fold(self.build_root.clone(), |acc, s| acc.join(s)))
    }

    pub fn directory_to_compiled_handler_path(&self, dir: &Path) -> Result<PathBuf, ConfigError> {
        Ok(self
            .directory_to_build_output_directory(dir)?
            .join(&self.compiled_handler_file_name))
    }

    pub fn directory_to_upload_directory(&self, dir: &Path) -> Result<PathBuf, ConfigError> {
        Ok(self
            .directory_to_build_output_directory(dir)?
            .join(&self.upload_subdirectory_name))
    }

    /// Paths that never take part in discovery or watching: dotfiles,
    /// dependency directories and the build output tree.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let path = normalize(path);
        if path.starts_with(&self.build_root) {
            return true;
        }
        let relative = path.strip_prefix(&self.root).unwrap_or(&path);
        relative.components().any(|c| match c {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                name.starts_with('.') || name == "node_modules"
            }
            _ => false,
        })
    }

    fn segments(&self, dir: &Path) -> Result<Vec<String>, ConfigError> {
        let dir = normalize(dir);
        let relative = dir
            .strip_prefix(&self.routes_root)
            .map_err(|_| ConfigError::OutsideRoutes(dir.clone()))?;
        Ok(relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect())
    }
}

/// Lexical normalization: drops `.`, folds `..`, never touches the disk.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn relative_inside(setting: &'static str, value: &str, allow_root: bool) -> Result<PathBuf, ConfigError> {
    let unified = value.replace('\\', "/");
    let path = Path::new(&unified);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => out.push(name),
            Component::CurDir => {}
            _ => {
                return Err(ConfigError::EscapesRoot {
                    setting,
                    value: value.to_string(),
                });
            }
        }
    }
    if out.as_os_str().is_empty() && !allow_root {
        return Err(ConfigError::EscapesRoot {
            setting,
            value: value.to_string(),
        });
    }
    Ok(out)
}

fn plain_file_name(setting: &'static str, value: &str) -> Result<String, ConfigError> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\\');
    if invalid {
        return Err(ConfigError::InvalidFileName {
            setting,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}
