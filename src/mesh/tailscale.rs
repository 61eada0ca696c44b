//! Tailscale daemon LocalAPI client.
//!
//! The LocalAPI is plain HTTP/1.1 spoken over the daemon's unix socket.  A
//! fresh connection is opened for every request; the daemon closes idle
//! connections quickly and calls are only made once per sync pass.

use std::path::PathBuf;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use log::debug;
use tokio::net::UnixStream;

use super::MeshControl;
use crate::error::{Error, Result};
use crate::types::{MaskedPrefsEdit, MeshPrefs};

pub const DEFAULT_SOCKET: &str = "/var/run/tailscale/tailscaled.sock";

/// Host header the daemon expects on LocalAPI requests.
const LOCALAPI_HOST: &str = "local-tailscaled.sock";
const PREFS_PATH: &str = "/localapi/v0/prefs";

pub struct LocalApiClient {
    socket: PathBuf,
}

impl LocalApiClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn request(&self, method: Method, path: &str, body: Vec<u8>) -> Result<Bytes> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            Error::Mesh(format!("connect to {}: {}", self.socket.display(), e))
        })?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::Mesh(format!("LocalAPI handshake: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("LocalAPI connection closed: {}", e);
            }
        });

        let req = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(HOST, LOCALAPI_HOST)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::Mesh(format!("build {} {}: {}", method, path, e)))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| Error::Mesh(format!("{} {}: {}", method, path, e)))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Mesh(format!("{} {}: reading body: {}", method, path, e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(Error::Mesh(format!(
                "{} {} returned {}: {}",
                method,
                path,
                status,
                String::from_utf8_lossy(&bytes).trim()
            )));
        }
        Ok(bytes)
    }
}

#[async_trait]
impl MeshControl for LocalApiClient {
    async fn get_prefs(&self) -> Result<MeshPrefs> {
        let body = self.request(Method::GET, PREFS_PATH, Vec::new()).await?;
        serde_json::from_slice(&body).map_err(|e| Error::Mesh(format!("decode prefs: {}", e)))
    }

    async fn edit_prefs(&self, edit: &MaskedPrefsEdit) -> Result<MeshPrefs> {
        let payload = serde_json::to_vec(edit)?;
        let body = self.request(Method::PATCH, PREFS_PATH, payload).await?;
        serde_json::from_slice(&body).map_err(|e| Error::Mesh(format!("decode prefs: {}", e)))
    }
}
