//! The OAI-PMH protocol client.
//!
//! [`OaiTransport`] is the seam the harvest engine depends on; [`OaiClient`]
//! is the HTTP implementation. Calls are stateless: the only state kept
//! between calls is the connection pool inside `reqwest::Client`.

use async_trait::async_trait;
use reqwest::Client;

use crate::config::{verb_url, ClientConfig};
use crate::error::{OaiError, Result};
use crate::http::{create_client, fetch_text};
use crate::response::ResponseEnvelope;
use crate::types::{Granularity, ListRecordsRequest, OaiSet, ProtocolErrorKind, Verb};

/// OAI-PMH verb requests against a repository base URL.
///
/// Every method returns the envelope even when the repository reported a
/// protocol error; only transport failures and non-OAI responses are `Err`.
#[async_trait]
pub trait OaiTransport: Send + Sync {
    async fn identify(&self, base_url: &str) -> Result<ResponseEnvelope>;

    async fn list_metadata_formats(
        &self,
        base_url: &str,
        identifier: Option<&str>,
    ) -> Result<ResponseEnvelope>;

    async fn list_sets(
        &self,
        base_url: &str,
        resumption_token: Option<&str>,
    ) -> Result<ResponseEnvelope>;

    /// First page of a selective harvest.
    async fn list_records(
        &self,
        base_url: &str,
        request: &ListRecordsRequest,
    ) -> Result<ResponseEnvelope>;

    /// Following pages; the token is sent exactly as the repository issued it.
    async fn list_records_resume(
        &self,
        base_url: &str,
        resumption_token: &str,
    ) -> Result<ResponseEnvelope>;

    async fn get_record(
        &self,
        base_url: &str,
        identifier: &str,
        metadata_prefix: &str,
    ) -> Result<ResponseEnvelope>;

    /// Find the prefix under which the repository serves a metadata namespace.
    ///
    /// Returns `Ok(None)` when no format with that namespace is offered.
    async fn resolve_namespace_to_prefix(
        &self,
        base_url: &str,
        namespace: &str,
    ) -> Result<Option<String>> {
        let formats = self
            .list_metadata_formats(base_url, None)
            .await?
            .into_checked()?
            .metadata_formats()?;
        Ok(formats
            .into_iter()
            .find(|f| f.metadata_namespace.trim() == namespace.trim())
            .map(|f| f.metadata_prefix))
    }

    /// Datestamp granularity declared by the repository.
    async fn granularity(&self, base_url: &str) -> Result<Granularity> {
        let identity = self.identify(base_url).await?.into_checked()?.identity()?;
        Ok(identity.granularity)
    }

    /// All sets, following resumption tokens.
    ///
    /// A repository without set support (`noSetHierarchy`) has no sets.
    async fn list_all_sets(&self, base_url: &str) -> Result<Vec<OaiSet>> {
        let mut sets = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let envelope = self.list_sets(base_url, token.as_deref()).await?;
            if envelope.has_error(&ProtocolErrorKind::NoSetHierarchy) {
                return Ok(sets);
            }
            let envelope = envelope.into_checked()?;
            sets.extend(envelope.sets()?);
            match envelope.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => return Ok(sets),
            }
        }
    }
}

/// HTTP implementation of [`OaiTransport`].
#[derive(Debug, Clone)]
pub struct OaiClient {
    http: Client,
    config: ClientConfig,
}

impl OaiClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = create_client(&config)?;
        Ok(Self { http, config })
    }

    /// Client with settings from the environment.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn request(
        &self,
        base_url: &str,
        verb: Verb,
        args: &[(&str, &str)],
    ) -> Result<ResponseEnvelope> {
        let url = verb_url(base_url, verb, args)?;
        tracing::debug!(%verb, url = %url, "OAI-PMH request");

        let body = fetch_text(&self.http, &url, &self.config).await?;
        let envelope = ResponseEnvelope::parse(verb, url, body)?;

        if let Some(error) = envelope.errors.first() {
            tracing::debug!(%verb, code = %error.kind, message = %error.message, "OAI-PMH error response");
        }
        Ok(envelope)
    }
}

#[async_trait]
impl OaiTransport for OaiClient {
    async fn identify(&self, base_url: &str) -> Result<ResponseEnvelope> {
        self.request(base_url, Verb::Identify, &[]).await
    }

    async fn list_metadata_formats(
        &self,
        base_url: &str,
        identifier: Option<&str>,
    ) -> Result<ResponseEnvelope> {
        match identifier {
            Some(id) => {
                self.request(base_url, Verb::ListMetadataFormats, &[("identifier", id)])
                    .await
            }
            None => self.request(base_url, Verb::ListMetadataFormats, &[]).await,
        }
    }

    async fn list_sets(
        &self,
        base_url: &str,
        resumption_token: Option<&str>,
    ) -> Result<ResponseEnvelope> {
        match resumption_token {
            Some(token) => {
                self.request(base_url, Verb::ListSets, &[("resumptionToken", token)])
                    .await
            }
            None => self.request(base_url, Verb::ListSets, &[]).await,
        }
    }

    async fn list_records(
        &self,
        base_url: &str,
        request: &ListRecordsRequest,
    ) -> Result<ResponseEnvelope> {
        if request.metadata_prefix.trim().is_empty() {
            return Err(OaiError::MissingElement {
                element: "metadataPrefix".to_string(),
                context: "ListRecords request".to_string(),
            });
        }

        let mut args: Vec<(&str, &str)> = vec![("metadataPrefix", request.metadata_prefix.as_str())];
        if let Some(from) = &request.from {
            args.push(("from", from.as_str()));
        }
        if let Some(until) = &request.until {
            args.push(("until", until.as_str()));
        }
        if let Some(set) = &request.set {
            args.push(("set", set.as_str()));
        }
        self.request(base_url, Verb::ListRecords, &args).await
    }

    async fn list_records_resume(
        &self,
        base_url: &str,
        resumption_token: &str,
    ) -> Result<ResponseEnvelope> {
        self.request(
            base_url,
            Verb::ListRecords,
            &[("resumptionToken", resumption_token)],
        )
        .await
    }

    async fn get_record(
        &self,
        base_url: &str,
        identifier: &str,
        metadata_prefix: &str,
    ) -> Result<ResponseEnvelope> {
        self.request(
            base_url,
            Verb::GetRecord,
            &[("identifier", identifier), ("metadataPrefix", metadata_prefix)],
        )
        .await
    }
}
