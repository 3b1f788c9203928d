//! Typed tree produced by [`crate::decode`].
//!
//! Every scanner field is kept as the text the scanner wrote. Converting
//! ports, certainties or timestamps into numbers is left to the caller.

use serde::{Deserialize, Serialize};

/// One host's scan result, decoded from the report's root element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRun {
    pub address: String,
    pub status: String,
    #[serde(default)]
    pub host_names: Vec<HostName>,
    #[serde(default)]
    pub fingerprints: Vec<Fingerprint>,
    #[serde(default)]
    pub tests: Vec<Test>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl ScanRun {
    /// Host-level tests first, then each service's tests in endpoint order.
    pub fn all_tests(&self) -> impl Iterator<Item = &Test> + '_ {
        self.tests.iter().chain(
            self.endpoints
                .iter()
                .flat_map(|endpoint| endpoint.services.iter())
                .flat_map(|service| service.tests.iter()),
        )
    }
}

/// One resolved name for the host, from `names > name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostName {
    pub name: String,
}

/// OS guess when owned by a [`ScanRun`], service guess when owned by a [`Service`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub certainty: String,
    pub device_class: String,
    pub vendor: String,
    pub family: String,
    pub product: String,
    pub version: String,
}

/// One vulnerability or compliance check result with its evidence paragraphs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Test {
    pub id: String,
    pub key: String,
    pub status: String,
    pub scan_id: String,
    pub vulnerable_since: String,
    pub pci_compliance_status: String,
    #[serde(default)]
    pub paragraphs: Vec<EvidenceNode>,
}

/// A `Paragraph` block of evidence.
///
/// The three slots are filled independently from the same element: its
/// direct character data, nested paragraphs, and the items of any bulleted
/// lists it contains. Each slot keeps document order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceNode {
    pub text: String,
    #[serde(default)]
    pub paragraphs: Vec<EvidenceNode>,
    #[serde(default)]
    pub list_items: Vec<ListItem>,
}

impl EvidenceNode {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.paragraphs.is_empty() && self.list_items.is_empty()
    }
}

/// Inner markup of a `ListItem`, byte-for-byte as it appeared in the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub content: String,
}

/// A protocol/port pair the scan observed, with the services found on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub protocol: String,
    pub port: String,
    pub status: String,
    #[serde(default)]
    pub services: Vec<Service>,
}

/// A service detected on an [`Endpoint`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub fingerprints: Vec<Fingerprint>,
    #[serde(default)]
    pub configurations: Vec<Configuration>,
    #[serde(default)]
    pub tests: Vec<Test>,
}

/// A `config` entry: the `name` attribute and the element's character data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub name: String,
    pub value: String,
}
