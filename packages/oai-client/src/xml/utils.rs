//! XML utility functions for navigating OAI-PMH responses.

use roxmltree::Node;

/// Get the tag name without namespace prefix.
///
/// # Examples
/// ```
/// use roxmltree::Document;
/// use oai_client::xml::get_tag_name;
///
/// let xml = r#"<oai:record xmlns:oai="http://www.openarchives.org/OAI/2.0/"/>"#;
/// let doc = Document::parse(xml).unwrap();
/// assert_eq!(get_tag_name(doc.root_element()), "record");
/// ```
pub fn get_tag_name<'a>(node: Node<'a, '_>) -> &'a str {
    node.tag_name().name()
}

/// Check whether a node is an element with the given namespace and local name.
pub fn is_element_ns(node: Node<'_, '_>, namespace: &str, tag: &str) -> bool {
    node.is_element() && node.tag_name().namespace() == Some(namespace) && get_tag_name(node) == tag
}

/// Find the first child element with the given tag name, ignoring namespace.
///
/// # Examples
/// ```
/// use roxmltree::Document;
/// use oai_client::xml::find_child;
///
/// let xml = r#"<root><child1/><child2/></root>"#;
/// let doc = Document::parse(xml).unwrap();
/// let root = doc.root_element();
///
/// assert!(find_child(root, "child1").is_some());
/// assert!(find_child(root, "missing").is_none());
/// ```
pub fn find_child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|child| child.is_element() && get_tag_name(*child) == tag)
}

/// Find the first child element in the given namespace.
pub fn find_child_ns<'a, 'input>(
    node: Node<'a, 'input>,
    namespace: &str,
    tag: &str,
) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|child| is_element_ns(*child, namespace, tag))
}

/// Find all child elements in the given namespace.
pub fn find_children_ns<'a, 'input>(
    node: Node<'a, 'input>,
    namespace: &'a str,
    tag: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(move |child| is_element_ns(*child, namespace, tag))
}

/// Find a descendant element matching a slash-separated path of tag names
/// in one namespace.
///
/// # Examples
/// ```
/// use roxmltree::Document;
/// use oai_client::xml::find_by_path_ns;
///
/// let ns = "http://www.openarchives.org/OAI/2.0/";
/// let xml = r#"<record xmlns="http://www.openarchives.org/OAI/2.0/"><header><identifier>oai:x:1</identifier></header></record>"#;
/// let doc = Document::parse(xml).unwrap();
///
/// let id = find_by_path_ns(doc.root_element(), ns, "header/identifier");
/// assert_eq!(id.and_then(|n| n.text()), Some("oai:x:1"));
/// ```
pub fn find_by_path_ns<'a, 'input>(
    node: Node<'a, 'input>,
    namespace: &str,
    path: &str,
) -> Option<Node<'a, 'input>> {
    let mut current = node;
    for part in path.split('/') {
        current = find_child_ns(current, namespace, part)?;
    }
    Some(current)
}

/// Get the text content of a node, trimmed.
pub fn get_text(node: Node<'_, '_>) -> String {
    node.text()
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Get the concatenated text of a node and all its descendants, trimmed.
pub fn deep_text(node: Node<'_, '_>) -> String {
    let text: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    text.trim().to_string()
}

/// Trimmed text of the first matching child, if present and non-empty.
pub fn child_text_ns(node: Node<'_, '_>, namespace: &str, tag: &str) -> Option<String> {
    find_child_ns(node, namespace, tag)
        .map(get_text)
        .filter(|s| !s.is_empty())
}

/// Get all element children of a node.
pub fn element_children<'a, 'input>(
    node: Node<'a, 'input>,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|child| child.is_element())
}

/// Cut an element out of its document as a standalone XML string.
///
/// Namespace declarations the element inherits from its ancestors are
/// copied onto its start tag, so the fragment parses on its own.
///
/// # Examples
/// ```
/// use roxmltree::Document;
/// use oai_client::xml::standalone_fragment;
///
/// let xml = r#"<a xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>T</dc:title></a>"#;
/// let doc = Document::parse(xml).unwrap();
/// let title = doc.root_element().first_element_child().unwrap();
///
/// let fragment = standalone_fragment(title, xml);
/// assert!(Document::parse(&fragment).is_ok());
/// ```
pub fn standalone_fragment(node: Node<'_, '_>, input: &str) -> String {
    let raw = &input[node.range()];
    let Some(parent) = node.parent() else {
        return raw.to_string();
    };

    let tag_end = start_tag_end(raw);
    let start_tag = &raw[..tag_end];
    let mut declarations = String::new();

    for ns in parent.namespaces() {
        let attr = match ns.name() {
            Some("xml") => continue,
            Some(prefix) => format!("xmlns:{prefix}"),
            None => "xmlns".to_string(),
        };
        if declares(start_tag, &attr) {
            continue;
        }
        declarations.push(' ');
        declarations.push_str(&attr);
        declarations.push_str("=\"");
        declarations.push_str(&escape_attribute(ns.uri()));
        declarations.push('"');
    }

    if declarations.is_empty() {
        return raw.to_string();
    }

    // Insert right after the element name.
    let name_end = raw[1..]
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .map(|i| i + 1)
        .unwrap_or(tag_end);
    let mut out = String::with_capacity(raw.len() + declarations.len());
    out.push_str(&raw[..name_end]);
    out.push_str(&declarations);
    out.push_str(&raw[name_end..]);
    out
}

/// Byte offset just past the start tag's name and attributes (before `>`).
fn start_tag_end(raw: &str) -> usize {
    let mut quote: Option<char> = None;
    for (i, c) in raw.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return i,
            _ => {}
        }
    }
    raw.len()
}

/// Whether a start tag already declares the given `xmlns` attribute.
fn declares(start_tag: &str, attr: &str) -> bool {
    start_tag
        .match_indices(attr)
        .any(|(i, _)| {
            let before_ok = start_tag[..i]
                .chars()
                .last()
                .is_some_and(char::is_whitespace);
            let after = start_tag[i + attr.len()..].trim_start();
            before_ok && after.starts_with('=')
        })
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use roxmltree::Document;

    const NS: &str = "http://www.openarchives.org/OAI/2.0/";

    #[test]
    fn test_get_tag_name_with_namespace() {
        let xml = r#"<ns:root xmlns:ns="http://example.com"><ns:child/></ns:root>"#;
        let doc = Document::parse(xml).unwrap();
        assert_eq!(get_tag_name(doc.root_element()), "root");
    }

    #[test]
    fn test_find_child_ns_ignores_other_namespaces() {
        let xml = r#"<root xmlns="http://www.openarchives.org/OAI/2.0/" xmlns:x="urn:x"><x:header/><header/></root>"#;
        let doc = Document::parse(xml).unwrap();
        let header = find_child_ns(doc.root_element(), NS, "header").unwrap();
        assert_eq!(header.tag_name().namespace(), Some(NS));
        assert_eq!(find_children_ns(doc.root_element(), NS, "header").count(), 1);
    }

    #[test]
    fn test_child_text_ns_skips_blank() {
        let xml = r#"<r xmlns="http://www.openarchives.org/OAI/2.0/"><a>  </a><b> v </b></r>"#;
        let doc = Document::parse(xml).unwrap();
        assert_eq!(child_text_ns(doc.root_element(), NS, "a"), None);
        assert_eq!(child_text_ns(doc.root_element(), NS, "b"), Some("v".to_string()));
    }

    #[test]
    fn test_deep_text() {
        let xml = "<al>Hello <em>world</em>!</al>";
        let doc = Document::parse(xml).unwrap();
        assert_eq!(deep_text(doc.root_element()), "Hello world!");
    }

    #[test]
    fn test_standalone_fragment_copies_inherited_namespaces() {
        let xml = r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/" xmlns:dc="http://purl.org/dc/elements/1.1/"><metadata><oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/"><dc:title>Title</dc:title></oai_dc:dc></metadata></OAI-PMH>"#;
        let doc = Document::parse(xml).unwrap();
        let dc = doc
            .descendants()
            .find(|n| n.is_element() && get_tag_name(*n) == "dc")
            .unwrap();

        let fragment = standalone_fragment(dc, xml);
        let parsed = Document::parse(&fragment).unwrap();
        let title = parsed.root_element().first_element_child().unwrap();
        assert_eq!(title.tag_name().namespace(), Some("http://purl.org/dc/elements/1.1/"));
        assert_eq!(title.text(), Some("Title"));
    }

    #[test]
    fn test_standalone_fragment_does_not_duplicate_declarations() {
        let xml = r#"<a xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:x xmlns:dc="http://purl.org/dc/elements/1.1/" id="a>b"/></a>"#;
        let doc = Document::parse(xml).unwrap();
        let inner = doc.root_element().first_element_child().unwrap();

        let fragment = standalone_fragment(inner, xml);
        assert_eq!(fragment.matches("xmlns:dc=").count(), 1);
        assert!(Document::parse(&fragment).is_ok());
    }

    #[test]
    fn test_start_tag_end_respects_quotes() {
        assert_eq!(start_tag_end(r#"<a b="x>y">"#), 10);
        assert_eq!(start_tag_end("<a/>"), 3);
    }
}
