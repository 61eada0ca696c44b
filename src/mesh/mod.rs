use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::error::Result;
use crate::types::{MaskedPrefsEdit, MeshPrefs};

pub mod tailscale;
pub use tailscale::LocalApiClient;

/// Control API of the overlay mesh daemon.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeshControl: Send + Sync {
    async fn get_prefs(&self) -> Result<MeshPrefs>;

    /// Submit a partial edit; only masked fields are applied.  Returns the
    /// preferences as the daemon holds them afterwards.
    async fn edit_prefs(&self, edit: &MaskedPrefsEdit) -> Result<MeshPrefs>;
}
