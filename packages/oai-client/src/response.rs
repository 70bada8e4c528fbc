//! Response envelope and OAI-PMH response parsing.
//!
//! Every verb returns a [`ResponseEnvelope`]: the raw XML, the protocol
//! errors the repository reported, and for list verbs the resumption token.
//! Protocol errors stay in the envelope; [`ResponseEnvelope::into_checked`]
//! turns them into [`OaiError::Protocol`] when the caller wants that.

use roxmltree::{Document, Node};

use crate::config::OAI_PMH_NAMESPACE;
use crate::error::{OaiError, Result};
use crate::types::{
    DeletedRecordPolicy, Granularity, MetadataFormat, OaiRecord, OaiSet, ProtocolError,
    ProtocolErrorKind, RecordHeader, RepositoryIdentity, ResumptionToken, Verb,
};
use crate::xml::{
    child_text_ns, deep_text, element_children, find_by_path_ns, find_child_ns,
    find_children_ns, get_text, is_element_ns, standalone_fragment,
};

const NS: &str = OAI_PMH_NAMESPACE;

/// A parsed OAI-PMH response.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub verb: Verb,
    pub request_url: String,
    pub response_date: Option<String>,
    pub errors: Vec<ProtocolError>,
    pub resumption_token: Option<ResumptionToken>,
    xml: String,
}

impl ResponseEnvelope {
    /// Parse a response body.
    ///
    /// Fails only when the body is not an OAI-PMH document at all; protocol
    /// errors are collected into [`ResponseEnvelope::errors`].
    pub fn parse(verb: Verb, request_url: impl Into<String>, xml: String) -> Result<Self> {
        let (response_date, errors, resumption_token) = {
            let doc = Document::parse(&xml)?;
            let root = doc.root_element();
            if !is_element_ns(root, NS, "OAI-PMH") {
                return Err(OaiError::MissingElement {
                    element: "OAI-PMH".to_string(),
                    context: format!("{verb} response"),
                });
            }

            let response_date = child_text_ns(root, NS, "responseDate");

            let errors: Vec<ProtocolError> = find_children_ns(root, NS, "error")
                .map(|node| ProtocolError {
                    kind: ProtocolErrorKind::from_code(node.attribute("code").unwrap_or_default()),
                    message: get_text(node),
                })
                .collect();

            let resumption_token = if verb.is_paged() && errors.is_empty() {
                find_child_ns(root, NS, verb.as_ref())
                    .and_then(|list| find_child_ns(list, NS, "resumptionToken"))
                    .map(parse_resumption_token)
            } else {
                None
            };

            (response_date, errors, resumption_token)
        };

        Ok(Self {
            verb,
            request_url: request_url.into(),
            response_date,
            errors,
            resumption_token,
            xml,
        })
    }

    /// The raw response body.
    #[must_use]
    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// Parse the raw body again into a DOM borrowing from this envelope.
    pub fn document(&self) -> Result<Document<'_>> {
        Ok(Document::parse(&self.xml)?)
    }

    /// Whether the repository reported the given error kind.
    #[must_use]
    pub fn has_error(&self, kind: &ProtocolErrorKind) -> bool {
        self.errors.iter().any(|e| &e.kind == kind)
    }

    /// `noRecordsMatch`: an empty list, not a failure.
    #[must_use]
    pub fn is_no_records_match(&self) -> bool {
        self.has_error(&ProtocolErrorKind::NoRecordsMatch)
    }

    /// The token for the next page, if the list continues.
    #[must_use]
    pub fn next_token(&self) -> Option<&str> {
        self.resumption_token.as_ref().and_then(ResumptionToken::next)
    }

    /// Return the envelope unchanged if it has no errors, otherwise the
    /// first error as [`OaiError::Protocol`].
    ///
    /// When several errors are present, `noRecordsMatch` only wins if it is
    /// the sole kind reported.
    pub fn into_checked(self) -> Result<Self> {
        let fatal = self
            .errors
            .iter()
            .find(|e| !e.kind.is_empty_result())
            .or_else(|| self.errors.first());
        match fatal {
            None => Ok(self),
            Some(error) => Err(OaiError::Protocol {
                kind: error.kind.clone(),
                message: error.message.clone(),
            }),
        }
    }

    /// Records of a `ListRecords` or `GetRecord` response, in document order.
    pub fn records(&self) -> Result<Vec<OaiRecord>> {
        let doc = self.document()?;
        let list = self.verb_element(&doc)?;
        find_children_ns(list, NS, "record")
            .map(|record| parse_record(record, &self.xml))
            .collect()
    }

    /// Headers of a `ListIdentifiers` response.
    pub fn headers(&self) -> Result<Vec<RecordHeader>> {
        let doc = self.document()?;
        let list = self.verb_element(&doc)?;
        find_children_ns(list, NS, "header")
            .map(parse_header)
            .collect()
    }

    /// Repository description of an `Identify` response.
    pub fn identity(&self) -> Result<RepositoryIdentity> {
        let doc = self.document()?;
        let identify = self.verb_element(&doc)?;

        let required = |tag: &str| {
            child_text_ns(identify, NS, tag).ok_or_else(|| OaiError::MissingElement {
                element: tag.to_string(),
                context: "Identify".to_string(),
            })
        };

        Ok(RepositoryIdentity {
            repository_name: required("repositoryName")?,
            base_url: required("baseURL")?,
            protocol_version: required("protocolVersion")?,
            earliest_datestamp: child_text_ns(identify, NS, "earliestDatestamp"),
            deleted_record: child_text_ns(identify, NS, "deletedRecord")
                .map(|t| DeletedRecordPolicy::from_text(&t))
                .unwrap_or_default(),
            granularity: child_text_ns(identify, NS, "granularity")
                .map(|t| Granularity::from_identify(&t))
                .unwrap_or(Granularity::Day),
            admin_emails: find_children_ns(identify, NS, "adminEmail")
                .map(get_text)
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }

    /// Formats of a `ListMetadataFormats` response.
    pub fn metadata_formats(&self) -> Result<Vec<MetadataFormat>> {
        let doc = self.document()?;
        let list = self.verb_element(&doc)?;
        let mut formats = Vec::new();
        for format in find_children_ns(list, NS, "metadataFormat") {
            let Some(metadata_prefix) = child_text_ns(format, NS, "metadataPrefix") else {
                tracing::warn!(url = %self.request_url, "metadataFormat without metadataPrefix, skipping");
                continue;
            };
            formats.push(MetadataFormat {
                metadata_prefix,
                schema: child_text_ns(format, NS, "schema"),
                metadata_namespace: child_text_ns(format, NS, "metadataNamespace")
                    .unwrap_or_default(),
            });
        }
        Ok(formats)
    }

    /// Sets of a `ListSets` response.
    pub fn sets(&self) -> Result<Vec<OaiSet>> {
        let doc = self.document()?;
        let list = self.verb_element(&doc)?;
        Ok(find_children_ns(list, NS, "set")
            .filter_map(|set| {
                let set_spec = child_text_ns(set, NS, "setSpec")?;
                let set_name = child_text_ns(set, NS, "setName").unwrap_or_default();
                Some(OaiSet { set_spec, set_name })
            })
            .collect())
    }

    /// The element named after the verb, e.g. `<ListRecords>`.
    fn verb_element<'a, 'input>(&self, doc: &'a Document<'input>) -> Result<Node<'a, 'input>> {
        find_child_ns(doc.root_element(), NS, self.verb.as_ref()).ok_or_else(|| {
            OaiError::MissingElement {
                element: self.verb.to_string(),
                context: self.request_url.clone(),
            }
        })
    }
}

fn parse_resumption_token(node: Node<'_, '_>) -> ResumptionToken {
    ResumptionToken {
        value: node.text().unwrap_or_default().trim().to_string(),
        complete_list_size: node
            .attribute("completeListSize")
            .and_then(|v| v.trim().parse().ok()),
        cursor: node.attribute("cursor").and_then(|v| v.trim().parse().ok()),
        expiration_date: node.attribute("expirationDate").map(str::to_string),
    }
}

fn parse_header(header: Node<'_, '_>) -> Result<RecordHeader> {
    let identifier = child_text_ns(header, NS, "identifier").ok_or_else(|| {
        OaiError::MissingElement {
            element: "identifier".to_string(),
            context: "record header".to_string(),
        }
    })?;
    let datestamp = child_text_ns(header, NS, "datestamp").ok_or_else(|| {
        OaiError::MissingElement {
            element: "datestamp".to_string(),
            context: format!("header of {identifier}"),
        }
    })?;

    Ok(RecordHeader {
        set_specs: find_children_ns(header, NS, "setSpec")
            .map(get_text)
            .filter(|s| !s.is_empty())
            .collect(),
        deleted: header.attribute("status") == Some("deleted"),
        identifier,
        datestamp,
    })
}

fn parse_record(record: Node<'_, '_>, input: &str) -> Result<OaiRecord> {
    let header = find_child_ns(record, NS, "header").ok_or_else(|| OaiError::MissingElement {
        element: "header".to_string(),
        context: "record".to_string(),
    })?;
    let header = parse_header(header)?;

    let metadata = if header.deleted {
        None
    } else {
        find_by_path_ns(record, NS, "metadata").and_then(|metadata| {
            match element_children(metadata).next() {
                Some(payload) => Some(standalone_fragment(payload, input)),
                // Some repositories send the payload as escaped text.
                None => Some(deep_text(metadata)).filter(|s| !s.is_empty()),
            }
        })
    };

    Ok(OaiRecord { header, metadata })
}
