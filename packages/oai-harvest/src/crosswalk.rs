//! Metadata format registry and the crosswalks from harvested XML to local
//! metadata values.
//!
//! A source names a format key (`dc`, `qdc`, `dim`); the registry maps it to
//! the namespace used to find the remote prefix and to the crosswalk applied
//! to each payload. Keys the registry does not know are sent to the remote
//! as a literal prefix and stored through [`Crosswalk::Raw`].

use std::collections::HashMap;

use roxmltree::{Document, Node};
use url::Url;

use crate::config::HandlePolicy;
use crate::error::{HarvestError, Result};
use crate::models::MetadataValue;

pub const DC_ELEMENTS_NAMESPACE: &str = "http://purl.org/dc/elements/1.1/";
pub const DC_TERMS_NAMESPACE: &str = "http://purl.org/dc/terms/";
pub const OAI_DC_NAMESPACE: &str = "http://www.openarchives.org/OAI/2.0/oai_dc/";
pub const DIM_NAMESPACE: &str = "http://www.dspace.org/xmlns/dspace/dim";
/// ORE resource maps are requested in their Atom serialization.
pub const ORE_ATOM_NAMESPACE: &str = "http://www.w3.org/2005/Atom";
pub const ORE_AGGREGATES: &str = "http://www.openarchives.org/ore/terms/aggregates";

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// How a metadata payload becomes local metadata values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crosswalk {
    /// Simple and qualified Dublin Core.
    DublinCore,
    /// DSpace intermediate format: `<dim:field mdschema element qualifier>`.
    Dim,
    /// The whole payload kept as one value.
    Raw,
}

impl Crosswalk {
    /// Apply the crosswalk to a well-formed payload.
    pub fn apply(self, payload: &str) -> Result<Vec<MetadataValue>> {
        let doc = Document::parse(payload).map_err(|e| HarvestError::Crosswalk(e.to_string()))?;
        let root = doc.root_element();
        match self {
            Self::DublinCore => Ok(dublin_core(root)),
            Self::Dim => dim(root),
            Self::Raw => Ok(vec![MetadataValue::new(
                "local",
                "harvest",
                Some("raw"),
                payload,
            )]),
        }
    }
}

fn language(node: Node<'_, '_>) -> Option<String> {
    node.attribute((XML_NAMESPACE, "lang"))
        .or_else(|| node.attribute("lang"))
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
}

fn dublin_core(root: Node<'_, '_>) -> Vec<MetadataValue> {
    root.descendants()
        .filter(|n| n.is_element())
        .filter_map(|node| {
            let schema = match node.tag_name().namespace() {
                Some(DC_ELEMENTS_NAMESPACE) => "dc",
                Some(DC_TERMS_NAMESPACE) => "dcterms",
                _ => return None,
            };
            let value = oai_client::xml::deep_text(node);
            if value.is_empty() {
                return None;
            }
            let mut field = MetadataValue::new(schema, node.tag_name().name(), None, value);
            field.language = language(node);
            Some(field)
        })
        .collect()
}

fn dim(root: Node<'_, '_>) -> Result<Vec<MetadataValue>> {
    if root.tag_name().namespace() != Some(DIM_NAMESPACE) {
        return Err(HarvestError::Crosswalk(format!(
            "expected a dim:dim document, found <{}>",
            root.tag_name().name()
        )));
    }

    let mut values = Vec::new();
    for field in root
        .children()
        .filter(|n| oai_client::xml::is_element_ns(*n, DIM_NAMESPACE, "field"))
    {
        let (Some(schema), Some(element)) = (field.attribute("mdschema"), field.attribute("element"))
        else {
            return Err(HarvestError::Crosswalk(
                "dim:field without mdschema or element".into(),
            ));
        };
        let value = oai_client::xml::deep_text(field);
        if value.is_empty() {
            continue;
        }
        let qualifier = field.attribute("qualifier").filter(|q| !q.is_empty());
        let mut entry = MetadataValue::new(schema, element, qualifier, value);
        entry.language = language(field);
        values.push(entry);
    }
    Ok(values)
}

/// One registered metadata format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatEntry {
    pub namespace: String,
    pub label: String,
    pub crosswalk: Crosswalk,
}

/// Format key → namespace and crosswalk.
#[derive(Debug, Clone)]
pub struct MetadataFormatRegistry {
    formats: HashMap<String, FormatEntry>,
}

impl Default for MetadataFormatRegistry {
    fn default() -> Self {
        let mut registry = Self {
            formats: HashMap::new(),
        };
        registry.register("dc", OAI_DC_NAMESPACE, "Simple Dublin Core", Crosswalk::DublinCore);
        registry.register("qdc", DC_TERMS_NAMESPACE, "Qualified Dublin Core", Crosswalk::DublinCore);
        registry.register("dim", DIM_NAMESPACE, "DSpace Intermediate Metadata", Crosswalk::Dim);
        registry
    }
}

impl MetadataFormatRegistry {
    pub fn register(
        &mut self,
        key: &str,
        namespace: &str,
        label: &str,
        crosswalk: Crosswalk,
    ) -> &mut Self {
        self.formats.insert(
            key.to_string(),
            FormatEntry {
                namespace: namespace.to_string(),
                label: label.to_string(),
                crosswalk,
            },
        );
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FormatEntry> {
        self.formats.get(key)
    }

    /// The crosswalk for a key; unknown keys keep the raw payload.
    #[must_use]
    pub fn crosswalk(&self, key: &str) -> Crosswalk {
        self.get(key).map_or(Crosswalk::Raw, |f| f.crosswalk)
    }
}

/// Find a handle in `dc.identifier` values.
///
/// Only URLs of the form `http(s)://<accepted server>/<prefix>/<suffix>` are
/// considered, and prefixes on the rejected list (placeholder installs) are
/// skipped.
#[must_use]
pub fn extract_handle(values: &[MetadataValue], policy: &HandlePolicy) -> Option<String> {
    values
        .iter()
        .filter(|v| v.matches_field("dc.identifier"))
        .find_map(|v| handle_from_url(v.value.trim(), policy))
}

fn handle_from_url(candidate: &str, policy: &HandlePolicy) -> Option<String> {
    let url = Url::parse(candidate).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?;
    if !policy
        .accepted_servers
        .iter()
        .any(|s| s.eq_ignore_ascii_case(host))
    {
        return None;
    }

    let segments: Vec<&str> = url.path_segments()?.collect();
    let [prefix, suffix] = segments.as_slice() else {
        return None;
    };
    if prefix.is_empty() || suffix.is_empty() {
        return None;
    }
    if policy.rejected_prefixes.iter().any(|p| p == prefix) {
        return None;
    }
    Some(format!("{prefix}/{suffix}"))
}

/// `href`s of the aggregated resources in an Atom ORE resource map.
pub fn ore_aggregated_links(ore_document: &str) -> Result<Vec<String>> {
    let doc =
        Document::parse(ore_document).map_err(|e| HarvestError::Crosswalk(e.to_string()))?;
    Ok(doc
        .descendants()
        .filter(|n| oai_client::xml::is_element_ns(*n, ORE_ATOM_NAMESPACE, "link"))
        .filter(|n| n.attribute("rel") == Some(ORE_AGGREGATES))
        .filter_map(|n| n.attribute("href"))
        .map(str::to_string)
        .collect())
}
