//! Resolving `type:version[:build]` tags to download URLs and keeping the
//! shared jar cache filled. Vanilla goes through Mojang's launcher
//! manifest, Paper through the PaperMC build API.

use std::{
    fs,
    io::{self, Read, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use bytesize::ByteSize;
use sha2::{Digest, Sha256};

use crate::storage::{self, Layout};

const VANILLA_MANIFEST_URL: &str =
    "https://launchermeta.mojang.com/mc/game/version_manifest.json";
const PAPER_API_URL: &str = "https://api.papermc.io/v2/projects/paper";
const REST_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = concat!("craftctl/", env!("CARGO_PKG_VERSION"));
const URL_TAG_LEN: usize = 12;

pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Tag for a literal-URL source: stable per URL, content-free.
pub fn url_tag(url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    format!("other:{}", &digest[..URL_TAG_LEN])
}

/// Resolve a server tag to `(download_url, fully_resolved_tag)`.
pub fn resolve(tag: &str) -> Result<(String, String)> {
    let Some((type_tag, version_tag)) = tag.split_once(':') else {
        bail!("Invalid server tag '{tag}' (expected type:version[:build])");
    };
    match type_tag {
        "vanilla" => resolve_vanilla(version_tag),
        "paper" => resolve_paper(version_tag),
        other => bail!("Unsupported server type '{other}'"),
    }
}

fn resolve_vanilla(version_tag: &str) -> Result<(String, String)> {
    let client = rest_client()?;
    let manifest = rest_get(&client, VANILLA_MANIFEST_URL)?;

    let version = match version_tag {
        "latest" => json_str(&manifest, &["latest", "release"])?.to_string(),
        "latest-snap" => json_str(&manifest, &["latest", "snapshot"])?.to_string(),
        other => other.to_string(),
    };

    let versions = manifest
        .get("versions")
        .and_then(|v| v.as_array())
        .context("version manifest has no 'versions' list")?;
    let meta_url = versions
        .iter()
        .find(|entry| entry.get("id").and_then(|id| id.as_str()) == Some(version.as_str()))
        .and_then(|entry| entry.get("url"))
        .and_then(|url| url.as_str())
        .with_context(|| format!("Server version not found for type 'vanilla': {version}"))?;

    let version_data = rest_get(&client, meta_url)?;
    let download_url = json_str(&version_data, &["downloads", "server", "url"])?.to_string();
    Ok((download_url, format!("vanilla:{version}")))
}

fn resolve_paper(version_tag: &str) -> Result<(String, String)> {
    let client = rest_client()?;
    let (version, build) = match version_tag.split_once(':') {
        Some((version, build)) => (version.to_string(), build.to_string()),
        None => (version_tag.to_string(), "latest".to_string()),
    };

    let version = if version == "latest" {
        let project = rest_get(&client, PAPER_API_URL)?;
        last_str_entry(&project, "versions").context("paper version list is empty")?
    } else {
        version
    };

    let builds_url = format!("{PAPER_API_URL}/versions/{version}");
    let builds = rest_get(&client, &builds_url)
        .with_context(|| format!("Server version not found for type 'paper': {version}"))?;
    let build = if build == "latest" {
        last_number_entry(&builds, "builds")
            .with_context(|| format!("no builds published for paper {version}"))?
    } else {
        build
    };

    let build_url = format!("{builds_url}/builds/{build}");
    let build_data = rest_get(&client, &build_url)
        .with_context(|| format!("Build not found for paper {version}: {build}"))?;
    let artifact = json_str(&build_data, &["downloads", "application", "name"])?;

    let download_url = format!("{build_url}/downloads/{artifact}");
    Ok((download_url, format!("paper:{version}:{build}")))
}

/// Fetch a server binary into the cache, returning its path and resolved
/// tag. Re-pulling a resolved tag is a cache hit. With
/// `allow_cache_fallback`, a tag the remote cannot resolve right now still
/// succeeds if an exact cached copy exists; creation should not depend on
/// upstream availability.
pub fn pull(
    layout: &Layout,
    source: &str,
    literal_url: bool,
    allow_cache_fallback: bool,
) -> Result<(PathBuf, String)> {
    let (url, tag) = if literal_url || is_url(source) {
        (source.to_string(), url_tag(source))
    } else {
        match resolve(source) {
            Ok(resolved) => resolved,
            Err(err) => {
                if allow_cache_fallback {
                    let cached = layout.jar_path(source);
                    if cached.is_file() {
                        tracing::warn!(tag = source, error = %err, "resolve failed, using cached jar");
                        return Ok((cached, source.to_string()));
                    }
                }
                return Err(err);
            }
        }
    };

    let dest = layout.jar_path(&tag);
    if dest.is_file() {
        tracing::info!(tag = %tag, "already cached, no download required");
        return Ok((dest, tag));
    }

    println!("Pulling version '{tag}'...");
    let parent = dest.parent().context("cache path has no parent")?;
    storage::create_dirs(parent)?;
    download(&url, &dest)?;
    Ok((dest, tag))
}

/// Download `url` to `dest` with a progress line, staging through a
/// temporary sibling so a failed transfer never leaves a half-written jar.
pub fn download(url: &str, dest: &Path) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .build()?;
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("requesting {url}"))?
        .error_for_status()
        .with_context(|| format!("downloading {url}"))?;

    let total = response.content_length();
    let parent = dest.parent().context("destination has no parent")?;
    let mut staged = tempfile::NamedTempFile::new_in(parent)?;

    let mut buf = [0u8; 65536];
    let mut loaded = 0u64;
    loop {
        let n = response.read(&mut buf)?;
        if n == 0 {
            break;
        }
        staged.write_all(&buf[..n])?;
        loaded += n as u64;
        if let Some(total) = total {
            print!(
                "\r{:>3}% {} / {}\x1b[K",
                loaded * 100 / total.max(1),
                ByteSize::b(loaded),
                ByteSize::b(total)
            );
            let _ = io::stdout().flush();
        }
    }
    if total.is_some() {
        println!();
    }

    staged.flush()?;
    staged.persist(dest).map_err(|err| err.error)?;
    fs::set_permissions(dest, fs::Permissions::from_mode(0o640))?;
    Ok(())
}

fn rest_client() -> Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REST_TIMEOUT)
        .build()?)
}

fn rest_get(client: &reqwest::blocking::Client, url: &str) -> Result<serde_json::Value> {
    let response = client
        .get(url)
        .send()
        .with_context(|| format!("requesting {url}"))?
        .error_for_status()
        .with_context(|| format!("querying {url}"))?;
    Ok(response.json()?)
}

fn json_str<'a>(value: &'a serde_json::Value, path: &[&str]) -> Result<&'a str> {
    let mut current = value;
    for key in path {
        current = current
            .get(key)
            .with_context(|| format!("response is missing '{}'", path.join(".")))?;
    }
    current
        .as_str()
        .with_context(|| format!("'{}' is not a string", path.join(".")))
}

fn last_str_entry(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)?
        .as_array()?
        .last()?
        .as_str()
        .map(str::to_string)
}

fn last_number_entry(value: &serde_json::Value, key: &str) -> Option<String> {
    let last = value.get(key)?.as_array()?.last()?;
    last.as_i64()
        .map(|n| n.to_string())
        .or_else(|| last.as_str().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_recognized() {
        assert!(is_url("https://example.com/server.jar"));
        assert!(is_url("http://example.com/server.jar"));
        assert!(!is_url("vanilla:1.20.1"));
        assert!(!is_url("/tmp/server.jar"));
    }

    #[test]
    fn url_tags_are_stable_and_short() {
        let a = url_tag("https://example.com/server.jar");
        let b = url_tag("https://example.com/server.jar");
        assert_eq!(a, b);
        assert!(a.starts_with("other:"));
        assert_eq!(a.len(), "other:".len() + URL_TAG_LEN);
        assert_ne!(a, url_tag("https://example.com/other.jar"));
    }

    #[test]
    fn tags_without_separator_are_rejected() {
        assert!(resolve("vanilla").is_err());
    }

    #[test]
    fn unsupported_types_are_rejected() {
        let err = resolve("forge:1.20.1").unwrap_err();
        assert!(err.to_string().contains("Unsupported server type"));
    }

    #[test]
    fn json_str_walks_nested_objects() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"downloads":{"server":{"url":"https://x/y.jar"}}}"#).unwrap();
        assert_eq!(
            json_str(&value, &["downloads", "server", "url"]).unwrap(),
            "https://x/y.jar"
        );
        assert!(json_str(&value, &["downloads", "client", "url"]).is_err());
    }

    #[test]
    fn last_entry_helpers_take_newest() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"versions":["1.19.4","1.20.1"],"builds":[100,196]}"#).unwrap();
        assert_eq!(last_str_entry(&value, "versions").unwrap(), "1.20.1");
        assert_eq!(last_number_entry(&value, "builds").unwrap(), "196");
    }
}
