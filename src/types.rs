//! Shared data types for REST responses and kernel-info content, used by
//! both the REST transport ([`crate::rest`]) and the websocket session
//! ([`crate::session`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A running kernel, as returned by the `api/kernels` family of endpoints.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct KernelModel {
    /// Opaque server-assigned kernel id.
    pub id: String,
    /// The kernelspec name this kernel was started from.
    pub name: String,
}

/// A kernel specification, describing how to start a kernel of a given
/// name.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct KernelSpec {
    /// Programmatic name of the kernel (e.g. `python3`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Human-readable name of the kernel (e.g. `Python 3`).
    pub display_name: String,
    /// The implementation language of the kernel.
    pub language: String,
    /// Command-line arguments used to start the kernel.
    #[serde(default)]
    pub argv: Vec<String>,
    /// Environment variables to set for the kernel process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Additional unrecognized resources (icons, etc.).
    #[serde(flatten)]
    pub resources: BTreeMap<String, Value>,
}

/// Response body of `GET api/kernelspecs`.
#[derive(Clone, Debug, Deserialize)]
pub struct KernelSpecsResponse {
    /// The name of the default kernelspec.
    pub default: Option<String>,
    /// All kernelspecs known to the server, keyed by name.
    pub kernelspecs: BTreeMap<String, KernelSpecEntry>,
}

/// One entry in a kernelspecs response.
#[derive(Clone, Debug, Deserialize)]
pub struct KernelSpecEntry {
    /// The kernelspec's programmatic name (redundant with the map key, but
    /// present on the wire).
    pub name: String,
    /// The kernelspec body.
    pub spec: KernelSpec,
}

/// Reply content for a `kernel_info_reply` message.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct KernelInfoReply {
    /// Version of the messaging protocol used by the kernel.
    pub protocol_version: String,
    /// The name of the kernel implementation (e.g. `ipython`).
    pub implementation: String,
    /// The version number of the kernel's implementation.
    pub implementation_version: String,
    /// Detailed information about the kernel's programming language.
    pub language_info: LanguageInfo,
    /// A banner displayed to the user describing the kernel.
    pub banner: String,
    /// Whether the kernel supports the debug adapter protocol.
    #[serde(default)]
    pub debugger: bool,
}

/// Detailed information about the programming language of a kernel.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LanguageInfo {
    /// Name of the programming language.
    pub name: String,
    /// Version number of the language.
    pub version: String,
    /// MIME type for script files in this language.
    pub mimetype: String,
    /// File extension for script files in this language.
    pub file_extension: String,
}
