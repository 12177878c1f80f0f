//! Parser for `207 Multi-Status` bodies returned by PROPFIND.
//!
//! Only the parts needed to enumerate a collection are read: each
//! `<response>`'s `<href>` and whether its `<resourcetype>` holds a
//! `<collection/>`. Namespace prefixes are ignored.

use quick_xml::Reader;
use quick_xml::events::Event;
use url::Url;

use crate::client::DavError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavEntry {
    /// Percent-decoded path of the entry on the server.
    pub path: String,
    /// Last path segment.
    pub name: String,
    pub is_collection: bool,
}

#[derive(Default)]
struct PendingResponse {
    href: Option<String>,
    is_collection: bool,
}

pub fn parse_multistatus(body: &str) -> Result<Vec<DavEntry>, DavError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut saw_multistatus = false;
    let mut current: Option<PendingResponse> = None;
    let mut in_href = false;
    let mut in_resourcetype = false;

    loop {
        match reader.read_event().map_err(parse_error)? {
            Event::Start(element) => match element.local_name().as_ref() {
                b"multistatus" => saw_multistatus = true,
                b"response" => current = Some(PendingResponse::default()),
                b"href" => in_href = current.is_some(),
                b"resourcetype" => in_resourcetype = true,
                b"collection" if in_resourcetype => mark_collection(&mut current),
                _ => {}
            },
            Event::Empty(element) => match element.local_name().as_ref() {
                b"collection" if in_resourcetype => mark_collection(&mut current),
                b"multistatus" => saw_multistatus = true,
                _ => {}
            },
            Event::Text(text) if in_href => {
                let value = text.unescape().map_err(parse_error)?;
                append_href(&mut current, &value);
            }
            Event::CData(data) if in_href => {
                let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                append_href(&mut current, &value);
            }
            Event::End(element) => match element.local_name().as_ref() {
                b"href" => in_href = false,
                b"resourcetype" => in_resourcetype = false,
                b"response" => {
                    let pending = current.take().unwrap_or_default();
                    let href = pending
                        .href
                        .ok_or_else(|| DavError::Parse("response without href".to_string()))?;
                    entries.push(entry_from_href(&href, pending.is_collection)?);
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_multistatus {
        return Err(DavError::Parse("missing multistatus element".to_string()));
    }
    Ok(entries)
}

fn mark_collection(current: &mut Option<PendingResponse>) {
    if let Some(pending) = current.as_mut() {
        pending.is_collection = true;
    }
}

fn append_href(current: &mut Option<PendingResponse>, value: &str) {
    if let Some(pending) = current.as_mut() {
        pending.href.get_or_insert_with(String::new).push_str(value);
    }
}

fn entry_from_href(href: &str, is_collection: bool) -> Result<DavEntry, DavError> {
    let href = href.trim();
    // Servers may answer with absolute URLs instead of absolute paths.
    let raw_path = if href.starts_with("http://") || href.starts_with("https://") {
        Url::parse(href)?.path().to_string()
    } else {
        href.to_string()
    };
    let path = percent_encoding::percent_decode_str(&raw_path)
        .decode_utf8()
        .map_err(|err| DavError::Parse(format!("href is not utf-8: {err}")))?
        .into_owned();
    let name = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    Ok(DavEntry {
        path,
        name,
        is_collection,
    })
}

fn parse_error(err: impl std::fmt::Display) -> DavError {
    DavError::Parse(err.to_string())
}
