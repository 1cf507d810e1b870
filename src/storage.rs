use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::token::TokenPool;
use crate::{RelayError, Result};

/// An audio asset renamed under a collision-free path
///
/// The spliced token stays checked out for the life of the owning request so
/// a concurrent upload of the same nominal file name cannot receive the same
/// spliced name. It is handed back when the request reaches a terminal state.
#[derive(Debug, Clone)]
pub struct ClaimedAsset {
    /// Path the asset now answers to
    pub path: PathBuf,
    /// Token spliced into the file name, still checked out
    pub token: String,
}

/// Renames inbound assets so no two requests ever share a path
pub struct AssetStore {
    root: PathBuf,
    tokens: Arc<TokenPool>,
}

impl AssetStore {
    /// Create a store resolving relative asset paths under `root`
    pub fn new(root: impl Into<PathBuf>, tokens: Arc<TokenPool>) -> Self {
        Self {
            root: root.into(),
            tokens,
        }
    }

    /// Claim an asset: splice a fresh token into its file name and rename it
    ///
    /// `speech.session.wav` claimed with token `ab12c` becomes
    /// `speech.sessionab12c.wav`; the original path stops existing. Applied
    /// exactly once per request, before any backend contact.
    pub async fn claim(&self, file_url: &str) -> Result<ClaimedAsset> {
        let path = self.resolve(file_url);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RelayError::InvalidInput(format!("asset path {} has no file name", file_url)))?;

        let token = self.tokens.allocate().await?;
        let new_name = match uniquified_name(name, &token) {
            Ok(new_name) => new_name,
            Err(e) => {
                self.tokens.release(&token).await;
                return Err(e);
            }
        };
        let new_path = path.with_file_name(&new_name);

        if let Err(e) = tokio::fs::rename(&path, &new_path).await {
            self.tokens.release(&token).await;
            return Err(RelayError::InvalidInput(format!(
                "cannot rename asset {}: {}",
                path.display(),
                e
            )));
        }

        debug!("claimed asset {} as {}", path.display(), new_path.display());
        Ok(ClaimedAsset { path: new_path, token })
    }

    /// Directory relative asset paths resolve against
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, file_url: &str) -> PathBuf {
        let path = Path::new(file_url);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Splice a token between a file name's stem and extension
///
/// The name must carry a non-empty stem and a non-empty `.`-separated
/// extension; only the final separator is treated as the extension boundary.
fn uniquified_name(name: &str, token: &str) -> Result<String> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            Ok(format!("{}{}.{}", stem, token, ext))
        }
        _ => Err(RelayError::InvalidInput(format!(
            "asset name {} has no stem/extension to splice into",
            name
        ))),
    }
}
