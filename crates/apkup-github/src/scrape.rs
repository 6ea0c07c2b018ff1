//! Extracts release data from the public HTML pages, used when the API is
//! rate limited.

use std::collections::HashSet;

use apkup_backend::{AssetDescriptor, FetchError, UNKNOWN_SIZE};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use regex::Regex;

/// Characters escaped when a tag is placed in a URL path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

const SEGMENT: &str = r#"[^/"'?#<>\s]+"#;

pub(crate) fn decode(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

pub(crate) fn encode_segment(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

fn compile(pattern: &str) -> Result<Regex, FetchError> {
    Regex::new(pattern)
        .map_err(|error| FetchError::network_parse_from("release page pattern", error))
}

/// Finds the release tag, preferring the redirect target over page links.
///
/// # Errors
/// Returns an error only if a search pattern cannot be compiled.
pub(crate) fn extract_tag(
    final_url: &str,
    body: &str,
    owner: &str,
    repo: &str,
) -> Result<Option<String>, FetchError> {
    let redirect = compile(&format!("/releases/tag/({SEGMENT})"))?;
    if let Some(captures) = redirect.captures(final_url) {
        return Ok(Some(decode(&captures[1])));
    }

    let scoped = compile(&format!(
        "(?i)/{}/{}/releases/tag/({SEGMENT})",
        regex::escape(owner),
        regex::escape(repo)
    ))?;
    Ok(scoped
        .captures(body)
        .map(|captures| decode(&captures[1])))
}

/// Collects `.apk` download links for `tag`, one per decoded file name in
/// first-seen order.
///
/// # Errors
/// Returns an error only if a search pattern cannot be compiled.
pub(crate) fn extract_apk_assets(
    body: &str,
    web_base: &str,
    owner: &str,
    repo: &str,
    tag: &str,
) -> Result<Vec<AssetDescriptor>, FetchError> {
    let pattern = compile(&format!(
        r"(?i)/{}/{}/releases/download/({SEGMENT})/({SEGMENT}\.apk)",
        regex::escape(owner),
        regex::escape(repo)
    ))?;

    let mut seen = HashSet::new();
    let mut assets = Vec::new();
    for captures in pattern.captures_iter(body) {
        let (raw_tag, raw_name) = (&captures[1], &captures[2]);
        if decode(raw_tag) != tag {
            continue;
        }
        let name = decode(raw_name);
        if !seen.insert(name.clone()) {
            continue;
        }

        let id = assets.len() as u64 + 1;
        let url = format!("{web_base}/{owner}/{repo}/releases/download/{raw_tag}/{raw_name}");
        assets.push(AssetDescriptor::new(id, name, UNKNOWN_SIZE, url));
    }

    Ok(assets)
}
