//! image name validation and tag expansion

use crate::digest::Digest;
use crate::error::{Error, Result};

pub const DEFAULT_TAG: &str = "latest";

const MAX_TAG_LEN: usize = 128;

/// validate an image name of the form `[host[:port]/]repo[/repo...][:tag][@sha256:hex]`
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = || Error::InvalidTag(name.to_string());

    let (rest, digest) = match name.split_once('@') {
        Some((rest, digest)) => (rest, Some(digest)),
        None => (name, None),
    };
    if let Some(digest) = digest {
        Digest::parse(digest).map_err(|_| invalid())?;
    }

    let (repo, tag) = split_tag(rest);
    if let Some(tag) = tag {
        if !valid_tag(tag) {
            return Err(invalid());
        }
    }

    if repo.is_empty() {
        return Err(invalid());
    }
    let components: Vec<&str> = repo.split('/').collect();
    let (host, path) = match components.split_first() {
        Some((first, rest)) if !rest.is_empty() && looks_like_host(first) => (Some(*first), rest),
        _ => (None, components.as_slice()),
    };

    if let Some(host) = host {
        if !valid_host(host) {
            return Err(invalid());
        }
    }
    if path.is_empty() || !path.iter().all(|c| valid_component(c)) {
        return Err(invalid());
    }

    Ok(())
}

/// add the default tag to a name that has neither a tag nor a digest
pub fn expand_tag(name: &str) -> Result<String> {
    validate_name(name)?;

    if name.contains('@') || split_tag(name).1.is_some() {
        return Ok(name.to_string());
    }
    Ok(format!("{}:{}", name, DEFAULT_TAG))
}

/// expand every name, dropping duplicates while keeping order
pub fn expand_tags(names: &[String]) -> Result<Vec<String>> {
    let mut expanded: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = expand_tag(name)?;
        if !expanded.contains(&name) {
            expanded.push(name);
        }
    }
    Ok(expanded)
}

/// strip any tag or digest from a name
pub fn repository(name: &str) -> &str {
    let name = name.split_once('@').map(|(n, _)| n).unwrap_or(name);
    split_tag(name).0
}

/// a ':' after the last '/' starts the tag; earlier ones belong to a host port
fn split_tag(name: &str) -> (&str, Option<&str>) {
    let slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[slash..].rfind(':') {
        Some(i) => (&name[..slash + i], Some(&name[slash + i + 1..])),
        None => (name, None),
    }
}

fn looks_like_host(component: &str) -> bool {
    component == "localhost" || component.contains('.') || component.contains(':')
}

fn valid_host(host: &str) -> bool {
    let (hostname, port) = match host.split_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (host, None),
    };
    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }
    !hostname.is_empty()
        && hostname
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                    && !label.starts_with('-')
                    && !label.ends_with('-')
            })
}

fn valid_component(component: &str) -> bool {
    let starts_and_ends_alnum = component
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && component
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());

    starts_and_ends_alnum
        && component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

fn valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    tag.len() <= MAX_TAG_LEN && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}
