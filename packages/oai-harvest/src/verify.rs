//! Checks a source configuration against its remote repository.

use std::fmt;

use oai_client::OaiTransport;
use serde::Serialize;

use crate::crosswalk::{MetadataFormatRegistry, ORE_ATOM_NAMESPACE};
use crate::models::SourceDefinition;

/// A configuration problem found by [`verify_source`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "problem", content = "detail", rename_all = "camelCase")]
pub enum VerifyProblem {
    /// The base URL does not answer `Identify`.
    InvalidAddress(String),
    /// The configured set is not listed by the remote.
    NoSuchSet(String),
    /// The remote does not disseminate the configured format.
    MetadataNotSupported(String),
    /// Content modes need ORE resource maps, which the remote does not offer.
    OreNotSupported,
}

impl VerifyProblem {
    /// The problem code shown to operators.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAddress(_) => "invalidAddress",
            Self::NoSuchSet(_) => "noSuchSet",
            Self::MetadataNotSupported(_) => "metadataNotSupported",
            Self::OreNotSupported => "oreNotSupported",
        }
    }
}

impl fmt::Display for VerifyProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress(e) => write!(f, "{}: {e}", self.code()),
            Self::NoSuchSet(set) => write!(f, "{}: {set}", self.code()),
            Self::MetadataNotSupported(format) => write!(f, "{}: {format}", self.code()),
            Self::OreNotSupported => write!(f, "{}", self.code()),
        }
    }
}

/// Verify `definition` against its remote. An empty list means the source is
/// ready to harvest.
///
/// An unreachable address is reported alone; the other checks need a
/// responding repository.
#[tracing::instrument(skip_all, fields(source_id = %definition.source_id, base_url = %definition.base_url))]
pub async fn verify_source<T>(
    transport: &T,
    registry: &MetadataFormatRegistry,
    definition: &SourceDefinition,
) -> Vec<VerifyProblem>
where
    T: OaiTransport + ?Sized,
{
    let base_url = definition.base_url.as_str();

    let identified = match transport.identify(base_url).await {
        Ok(envelope) => envelope.into_checked().and_then(|e| e.identity()),
        Err(e) => Err(e),
    };
    if let Err(e) = identified {
        tracing::warn!(error = %e, "repository did not answer Identify");
        return vec![VerifyProblem::InvalidAddress(e.to_string())];
    }

    let mut problems = Vec::new();

    if let Some(set) = definition.effective_set() {
        match transport.list_all_sets(base_url).await {
            Ok(sets) if sets.iter().any(|s| s.set_spec == set) => {}
            Ok(_) => problems.push(VerifyProblem::NoSuchSet(set.to_string())),
            Err(e) => {
                tracing::warn!(error = %e, "ListSets failed");
                problems.push(VerifyProblem::NoSuchSet(set.to_string()));
            }
        }
    }

    let format_supported = match registry.get(&definition.metadata_format) {
        Some(format) => transport
            .resolve_namespace_to_prefix(base_url, &format.namespace)
            .await
            .is_ok_and(|prefix| prefix.is_some()),
        None => supports_prefix(transport, base_url, &definition.metadata_format).await,
    };
    if !format_supported {
        problems.push(VerifyProblem::MetadataNotSupported(
            definition.metadata_format.clone(),
        ));
    }

    if definition.harvest_mode.needs_ore() {
        let ore = transport
            .resolve_namespace_to_prefix(base_url, ORE_ATOM_NAMESPACE)
            .await
            .is_ok_and(|prefix| prefix.is_some());
        if !ore {
            problems.push(VerifyProblem::OreNotSupported);
        }
    }

    problems
}

async fn supports_prefix<T>(transport: &T, base_url: &str, prefix: &str) -> bool
where
    T: OaiTransport + ?Sized,
{
    let formats = match transport.list_metadata_formats(base_url, None).await {
        Ok(envelope) => envelope.into_checked().and_then(|e| e.metadata_formats()),
        Err(e) => Err(e),
    };
    formats.is_ok_and(|formats| formats.iter().any(|f| f.metadata_prefix == prefix))
}
