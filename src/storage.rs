//! On-disk layout: instance directories, the shared jar cache, and the
//! archive import/export paths. All paths hang off the service account's
//! home directory.

use std::{
    ffi::CString,
    fs,
    io::{self, Read, Write},
    os::unix::fs::{DirBuilderExt, PermissionsExt},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::{privileges, properties, settings::Settings};

pub const SERVER_JAR: &str = "server.jar";
pub const PROPERTIES_FILE: &str = "server.properties";
pub const EULA_FILE: &str = "eula.txt";
pub const LOG_FILE: &str = "logs/latest.log";
const INSTANCE_DIR_MODE: u32 = 0o750;

#[derive(Debug, Clone)]
pub struct Layout {
    home: PathBuf,
}

impl Layout {
    pub fn new(home: PathBuf) -> Self {
        Self { home }
    }

    /// Layout rooted at the service account's home directory.
    pub fn for_settings(settings: &Settings) -> Result<Self> {
        let user = privileges::lookup_user(&settings.system.server_user)
            .with_context(|| format!("service user '{}'", settings.system.server_user))?;
        Ok(Self::new(user.home))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.home.join("instances")
    }

    pub fn instance_dir(&self, instance: &str) -> PathBuf {
        self.instances_dir().join(instance)
    }

    pub fn server_jar(&self, instance: &str) -> PathBuf {
        self.instance_dir(instance).join(SERVER_JAR)
    }

    pub fn server_properties(&self, instance: &str) -> PathBuf {
        self.instance_dir(instance).join(PROPERTIES_FILE)
    }

    pub fn env_file(&self, instance: &str, settings: &Settings) -> PathBuf {
        self.instance_dir(instance).join(&settings.system.env_file)
    }

    pub fn plugin_dir(&self, instance: &str) -> PathBuf {
        self.instance_dir(instance).join("plugins")
    }

    pub fn log_path(&self, instance: &str) -> PathBuf {
        self.instance_dir(instance).join(LOG_FILE)
    }

    pub fn jar_cache_dir(&self) -> PathBuf {
        self.home.join("jars")
    }

    /// Cache path for a resolved tag: `jars/<type>/<version>[/<build>].jar`.
    pub fn jar_path(&self, tag: &str) -> PathBuf {
        self.jar_cache_dir()
            .join(format!("{}.jar", tag.replace(':', "/")))
    }
}

/// mkdir -p with owner-rwx, group-rx, nothing for the world.
pub fn create_dirs(path: &Path) -> io::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(INSTANCE_DIR_MODE)
        .create(path)
}

pub fn symlink_file(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

/// Replace `link` with a symlink to `target` without a window where the
/// link is missing: stage a sibling link, then rename over.
pub fn swap_symlink(target: &Path, link: &Path) -> Result<()> {
    let mut staged_name = link
        .file_name()
        .with_context(|| format!("invalid link path: {}", link.display()))?
        .to_os_string();
    staged_name.push(".staged");
    let staged = link.with_file_name(staged_name);
    if staged.symlink_metadata().is_ok() {
        fs::remove_file(&staged)?;
    }
    std::os::unix::fs::symlink(target, &staged)
        .with_context(|| format!("staging symlink at {}", staged.display()))?;
    fs::rename(&staged, link).with_context(|| format!("replacing {}", link.display()))?;
    Ok(())
}

/// Change ownership of `path` and everything below it. Symlinks themselves
/// are re-owned, their targets are left alone.
pub fn chown_recursive(path: &Path, uid: libc::uid_t, gid: libc::gid_t) -> Result<()> {
    chown_single(path, uid, gid)?;
    if path.is_dir() {
        for child in child_paths(path)? {
            chown_single(&child, uid, gid)?;
        }
    }
    Ok(())
}

fn chown_single(path: &Path, uid: libc::uid_t, gid: libc::gid_t) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_encoded_bytes())
        .with_context(|| format!("path contains NUL: {}", path.display()))?;
    let rc = unsafe { libc::lchown(cpath.as_ptr(), uid, gid) };
    if rc != 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("chown {}", path.display()));
    }
    Ok(())
}

/// All files and directories below `path`, sorted, depth included.
pub fn child_paths(path: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut stack = vec![path.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)
            .with_context(|| format!("reading directory {}", current.display()))?
        {
            let entry = entry?;
            let entry_path = entry.path();
            if entry_path.is_dir() && !entry_path.is_symlink() {
                stack.push(entry_path.clone());
            }
            found.push(entry_path);
        }
    }
    found.sort();
    Ok(found)
}

/// Children of `path` relative to it, optionally keeping only entries whose
/// first component contains `filter`.
pub fn relative_children(path: &Path, filter: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut relative = Vec::new();
    for child in child_paths(path)? {
        let rel = child
            .strip_prefix(path)
            .with_context(|| format!("{} is outside {}", child.display(), path.display()))?
            .to_path_buf();
        if let Some(filter) = filter {
            let first = rel
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .unwrap_or_default();
            if !first.contains(filter) {
                continue;
            }
        }
        relative.push(rel);
    }
    Ok(relative)
}

/// SHA-256 of a file's contents, for change detection on config edits.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Cached jars in `type:version[:build]` display form.
pub fn list_jars(layout: &Layout, filter: Option<&str>) -> Result<Vec<String>> {
    let cache = layout.jar_cache_dir();
    if !cache.is_dir() {
        return Ok(Vec::new());
    }
    let mut tags = Vec::new();
    for rel in relative_children(&cache, None)? {
        if rel.extension().and_then(|e| e.to_str()) != Some("jar") {
            continue;
        }
        let tag = rel
            .with_extension("")
            .to_string_lossy()
            .replace('/', ":");
        if filter.is_none_or(|f| tag.contains(f)) {
            tags.push(tag);
        }
    }
    Ok(tags)
}

pub fn list_instances(layout: &Layout) -> Result<Vec<String>> {
    let dir = layout.instances_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Archive an instance into a zip. `world_only` keeps just the world
/// directory named by `level-name` in server.properties.
pub fn export(
    layout: &Layout,
    instance: &str,
    out_path: Option<PathBuf>,
    compress: bool,
    world_only: bool,
) -> Result<PathBuf> {
    let instance_dir = layout.instance_dir(instance);
    if !instance_dir.is_dir() {
        bail!("Instance not found: {}", instance_dir.display());
    }

    let world_filter = if world_only {
        let props = properties::read_file(&layout.server_properties(instance))?;
        Some(
            props
                .get("level-name")
                .unwrap_or("world")
                .to_string(),
        )
    } else {
        None
    };

    let zip_path = out_path.unwrap_or_else(|| default_export_path(instance));
    let entries = relative_children(&instance_dir, world_filter.as_deref())?;
    let total_size: u64 = entries
        .iter()
        .filter_map(|rel| fs::metadata(instance_dir.join(rel)).ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum();

    let method = if compress {
        zip::CompressionMethod::Deflated
    } else {
        zip::CompressionMethod::Stored
    };
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(method)
        .large_file(true);

    let file = fs::File::create(&zip_path)
        .with_context(|| format!("creating {}", zip_path.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let mut written = 0u64;
    for rel in &entries {
        let full = instance_dir.join(rel);
        let name = rel.to_string_lossy().into_owned();
        if full.is_dir() {
            writer.add_directory(name, options)?;
            continue;
        }
        writer.start_file(name, options)?;
        let mut src = fs::File::open(&full)?;
        written += io::copy(&mut src, &mut writer)?;
        if total_size > 0 {
            print!(
                "\r[{:>3}%] Writing: {}...\x1b[K",
                written * 100 / total_size,
                rel.display()
            );
            let _ = io::stdout().flush();
        }
    }
    writer.finish()?;
    println!();
    Ok(zip_path)
}

fn default_export_path(instance: &str) -> PathBuf {
    let stamp = time::format_description::parse(
        "[year repr:last_two]-[month]-[day]-[hour].[minute].[second]",
    )
    .ok()
    .and_then(|format| OffsetDateTime::now_utc().format(&format).ok())
    .unwrap_or_else(|| "archive".to_string());
    PathBuf::from(format!("{instance}_{stamp}.zip"))
}

/// Unpack a previously exported archive into a fresh instance directory.
pub fn import(layout: &Layout, zip_path: &Path, instance: &str) -> Result<PathBuf> {
    let dest = layout.instance_dir(instance);
    if dest.exists() {
        bail!("Instance already exists: {}", dest.display());
    }

    let file =
        fs::File::open(zip_path).with_context(|| format!("opening {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)?;
    create_dirs(&dest)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(rel) = entry.enclosed_name() else {
            bail!("Archive entry escapes the instance directory: {}", entry.name());
        };
        let out = dest.join(rel);
        if entry.is_dir() {
            create_dirs(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            create_dirs(parent)?;
        }
        let mut target = fs::File::create(&out)?;
        io::copy(&mut entry, &mut target)?;
        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(&out, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(dest)
}

/// Last `limit` lines of the instance's logs, newest file first. A limit of
/// zero returns everything in `latest.log`.
pub fn tail_logs(layout: &Layout, instance: &str, limit: usize) -> Result<Vec<String>> {
    let logs_dir = layout.instance_dir(instance).join("logs");
    if !logs_dir.is_dir() {
        bail!("No logs found for instance '{instance}'");
    }

    let mut log_files: Vec<PathBuf> = fs::read_dir(&logs_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("log"))
        .collect();
    log_files.sort();

    let mut lines: Vec<String> = Vec::new();
    for log in log_files.iter().rev() {
        let content = fs::read_to_string(log)
            .with_context(|| format!("reading {}", log.display()))?;
        let mut file_lines: Vec<String> = content.lines().map(str::to_string).collect();
        file_lines.extend(lines);
        lines = file_lines;
        if limit == 0 || lines.len() >= limit {
            break;
        }
    }

    if limit != 0 && lines.len() > limit {
        lines.drain(..lines.len() - limit);
    }
    Ok(lines)
}

/// Delete one cached jar, or the whole cache with tag `all`.
pub fn remove_jar(layout: &Layout, tag: &str, force: bool) -> Result<()> {
    let (del_path, prompt) = if tag == "all" {
        (
            layout.jar_cache_dir(),
            "Remove ALL cached server jars?".to_string(),
        )
    } else {
        (
            layout.jar_path(tag),
            format!("Remove the cached server jar '{tag}'?"),
        )
    };
    if !del_path.exists() {
        bail!("Tag not found in cache: {tag}");
    }

    if !force && !crate::lifecycle::confirm(&prompt)? {
        println!("Cancelled.");
        return Ok(());
    }

    if del_path.is_dir() {
        fs::remove_dir_all(&del_path)?;
    } else {
        fs::remove_file(&del_path)?;
    }
    Ok(())
}
