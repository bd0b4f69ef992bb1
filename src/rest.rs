//! REST transport for the Jupyter kernel management API.
//!
//! Covers `api/kernels`, `api/kernels/<id>/interrupt`, `api/kernels/<id>/restart`
//! and `api/kernelspecs`. This is a thin, stateless HTTP client: caching and
//! change-detection live one layer up, in [`crate::manager`].

use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{
    header::{self, HeaderMap},
    StatusCode,
};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::warn;
use url::Url;

use crate::types::{KernelModel, KernelSpec, KernelSpecEntry};
use crate::{Error, Result};

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string()
}

/// A fully described running kernel, as returned by `GET api/kernels`.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct KernelStatus {
    /// Opaque server-assigned kernel id.
    pub id: String,
    /// The kernelspec name this kernel was started from.
    pub name: String,
    /// Last activity ISO timestamp reported by the server.
    #[serde(with = "time::serde::iso8601")]
    pub last_activity: OffsetDateTime,
    /// The kernel's last broadcast execution state (`starting`, `idle`, ...).
    pub execution_state: String,
    /// The number of websocket connections currently attached.
    pub connections: u32,
}

/// A stateless HTTP client for a Jupyter server's kernel management REST
/// API.
#[derive(Clone, Debug)]
pub struct RestClient {
    base_url: Url,
    token: String,
    http: reqwest::Client,
}

impl RestClient {
    /// Build a client against the given base URL, authenticating with the
    /// server's token. Performs no I/O.
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if !token.is_empty() {
            headers.insert(
                header::AUTHORIZATION,
                format!("token {token}")
                    .parse()
                    .map_err(|_| Error::InvalidResponse("invalid token header".to_string()))?,
            );
        }
        let http = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            base_url: Url::parse(base_url)?,
            token: token.to_string(),
            http,
        })
    }

    /// The base URL this client was constructed with.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The token this client authenticates with, used by the session layer
    /// to build the websocket `Authorization` header.
    pub fn token(&self) -> &str {
        &self.token
    }

    fn join(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    async fn check_status(resp: reqwest::Response, path: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(Error::BadStatus {
                status: status.as_u16(),
                path: path.to_string(),
            })
        }
    }

    /// `GET api/kernels` — list all running kernels.
    pub async fn list_kernels(&self) -> Result<Vec<KernelStatus>> {
        let path = "api/kernels";
        let resp = self.http.get(self.join(path)?).send().await?;
        let resp = Self::check_status(resp, path).await?;
        Ok(resp.json().await?)
    }

    /// `GET api/kernels/<id>` — fetch a single running kernel, `None` if it
    /// no longer exists.
    pub async fn get_kernel(&self, kernel_id: &str) -> Result<Option<KernelStatus>> {
        let path = format!("api/kernels/{}", encode(kernel_id));
        let resp = self.http.get(self.join(&path)?).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check_status(resp, &path).await?;
        Ok(Some(resp.json().await?))
    }

    /// `POST api/kernels` — start a new kernel from the named kernelspec.
    pub async fn start_kernel(&self, spec_name: &str) -> Result<KernelModel> {
        let path = "api/kernels";
        let resp = self
            .http
            .post(self.join(path)?)
            .json(&json!({ "name": spec_name }))
            .send()
            .await?;
        let resp = Self::check_status(resp, path).await?;
        Ok(resp.json().await?)
    }

    /// `DELETE api/kernels/<id>` — shut down a running kernel.
    pub async fn shutdown_kernel(&self, kernel_id: &str) -> Result<()> {
        let path = format!("api/kernels/{}", encode(kernel_id));
        let resp = self.http.delete(self.join(&path)?).send().await?;
        Self::check_status(resp, &path).await?;
        Ok(())
    }

    /// `POST api/kernels/<id>/interrupt` — ask the kernel to interrupt its
    /// currently running cell via SIGINT (or the platform equivalent).
    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<()> {
        let path = format!("api/kernels/{}/interrupt", encode(kernel_id));
        let resp = self.http.post(self.join(&path)?).send().await?;
        Self::check_status(resp, &path).await?;
        Ok(())
    }

    /// `POST api/kernels/<id>/restart` — restart a kernel process in place,
    /// keeping its id.
    pub async fn restart_kernel(&self, kernel_id: &str) -> Result<KernelModel> {
        let path = format!("api/kernels/{}/restart", encode(kernel_id));
        let resp = self.http.post(self.join(&path)?).send().await?;
        let resp = Self::check_status(resp, &path).await?;
        Ok(resp.json().await?)
    }

    /// `GET api/kernelspecs` — list all kernelspecs the server knows about,
    /// plus which one (if any) is marked as the default.
    ///
    /// Validated per entry rather than as one strict payload: a malformed
    /// kernelspec entry is dropped (with a `tracing::warn!`) instead of
    /// failing the whole call, since one broken entry shouldn't hide every
    /// other, well-formed kernelspec from callers. Only a payload with no
    /// `kernelspecs` map, or none of whose entries parse, is an error.
    pub async fn list_kernelspecs(&self) -> Result<(Option<String>, Vec<(String, KernelSpec)>)> {
        let path = "api/kernelspecs";
        let resp = self.http.get(self.join(path)?).send().await?;
        let resp = Self::check_status(resp, path).await?;
        let body: Value = resp.json().await?;
        let default = body
            .get("default")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let entries = body.get("kernelspecs").and_then(Value::as_object).ok_or_else(|| {
            Error::InvalidResponse("kernelspecs response is missing a `kernelspecs` object".to_string())
        })?;
        let mut specs = Vec::new();
        for (name, raw) in entries {
            match serde_json::from_value::<KernelSpecEntry>(raw.clone()) {
                Ok(entry) => specs.push((name.clone(), entry.spec)),
                Err(err) => warn!("dropping invalid kernelspec entry {name:?}: {err}"),
            }
        }
        if specs.is_empty() {
            return Err(Error::InvalidResponse(
                "kernelspecs response has no valid entries".to_string(),
            ));
        }
        Ok((default, specs))
    }

    /// `GET api/kernelspecs/<name>` — fetch a single kernelspec by name,
    /// `None` if unknown.
    pub async fn get_kernelspec(&self, name: &str) -> Result<Option<KernelSpec>> {
        let path = format!("api/kernelspecs/{}", encode(name));
        let resp = self.http.get(self.join(&path)?).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check_status(resp, &path).await?;
        #[derive(serde::Deserialize)]
        struct Entry {
            spec: KernelSpec,
        }
        Ok(Some(resp.json::<Entry>().await?.spec))
    }

    /// Build the `wss://`/`ws://` URL (with the session id query parameter)
    /// used to open the multiplexed channel websocket for a kernel.
    pub fn websocket_url(&self, kernel_id: &str, client_id: &str) -> Result<Url> {
        let path = format!("api/kernels/{}/channels", encode(kernel_id));
        let mut url = self.join(&path)?;
        match url.scheme() {
            "https" => url.set_scheme("wss").ok(),
            _ => url.set_scheme("ws").ok(),
        };
        url.query_pairs_mut().append_pair(
            "session_id",
            &utf8_percent_encode(client_id, NON_ALPHANUMERIC).to_string(),
        );
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_rewrites_scheme_and_adds_session_id() {
        let client = RestClient::new("https://example.com:8888/", "tok").unwrap();
        let url = client.websocket_url("abc-123", "client-1").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/api/kernels/abc-123/channels");
        assert_eq!(url.query_pairs().next(), Some(("session_id".into(), "client-1".into())));
    }

    #[test]
    fn websocket_url_percent_encodes_kernel_id() {
        let client = RestClient::new("http://localhost:8888/", "").unwrap();
        let url = client.websocket_url("weird id/?", "c").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert!(url.path().contains("weird%20id%2F%3F"));
    }

    #[test]
    fn rejects_unparseable_base_url() {
        assert!(RestClient::new("not a url", "tok").is_err());
    }
}
