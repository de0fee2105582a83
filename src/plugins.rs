//! Plugin management for one instance. A plugin's identity is exactly its
//! filename inside `plugins/`; there is no separate metadata store.

use std::{
    fs,
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use dialoguer::Select;

use crate::{
    lifecycle,
    privileges,
    service::{ServiceUnit, UnitAction},
    settings::Settings,
    storage::{self, Layout},
    web,
};

const PLUGIN_SUFFIX: &str = "jar";
const PLUGIN_MODE: u32 = 0o640;

/// Pluggable lexical similarity used by the auto-upgrade pass. Version
/// matching is a heuristic, so both the strategy and its tunables stay
/// explicit.
pub trait Similarity {
    fn ratio(&self, a: &str, b: &str) -> f64;
}

/// 1 - levenshtein(a, b) / max(|a|, |b|), on Unicode scalar values.
pub struct NormalizedLevenshtein;

impl Similarity for NormalizedLevenshtein {
    fn ratio(&self, a: &str, b: &str) -> f64 {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        let longest = a.len().max(b.len());
        if longest == 0 {
            return 1.0;
        }
        1.0 - levenshtein(&a, &b) as f64 / longest as f64
    }
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Candidates from `pool` whose similarity to `name` clears `threshold`,
/// best first, at most `cap` entries.
pub fn close_matches(
    name: &str,
    pool: &[String],
    matcher: &dyn Similarity,
    threshold: f64,
    cap: usize,
) -> Vec<String> {
    let mut scored: Vec<(f64, &String)> = pool
        .iter()
        .map(|candidate| (matcher.ratio(name, candidate), candidate))
        .filter(|(score, _)| *score >= threshold)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.into_iter().take(cap).map(|(_, c)| c.clone()).collect()
}

/// Tunables for the auto-uninstall heuristic.
#[derive(Debug, Clone, Copy)]
pub struct UpgradeTunables {
    pub threshold: f64,
    pub max_matches: usize,
}

impl Default for UpgradeTunables {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            max_matches: 2,
        }
    }
}

fn plugin_dir_checked(layout: &Layout, instance: &str) -> Result<PathBuf> {
    let instance_path = layout.instance_dir(instance);
    if !instance_path.is_dir() {
        bail!("Instance not found: {}", instance_path.display());
    }
    let plugin_dir = layout.plugin_dir(instance);
    if !plugin_dir.is_dir() {
        bail!("This instance does not support plugins");
    }
    Ok(plugin_dir)
}

pub fn installed_plugins(layout: &Layout, instance: &str) -> Result<Vec<String>> {
    let plugin_dir = plugin_dir_checked(layout, instance)?;
    let mut names: Vec<String> = fs::read_dir(&plugin_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(&format!(".{PLUGIN_SUFFIX}")))
        .collect();
    names.sort();
    Ok(names)
}

/// Install plugin files or archives from local paths or URLs.
pub fn install(
    settings: &Settings,
    layout: &Layout,
    instance: &str,
    sources: &[String],
    restart: bool,
    autoupgrade: bool,
    force: bool,
) -> Result<()> {
    let plugin_dir = plugin_dir_checked(layout, instance)?;
    if sources.is_empty() {
        bail!("No plugins specified to install");
    }

    // URL sources land in a scratch dir that is removed no matter how the
    // install ends.
    let scratch = tempfile::TempDir::new()?;
    let mut files: Vec<PathBuf> = Vec::new();
    for source in sources {
        if web::is_url(source) {
            println!("Downloading '{source}'...");
            let filename = source
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .context("URL has no filename component")?;
            let dest = scratch.path().join(filename);
            web::download(source, &dest)?;
            files.push(dest);
        } else {
            let path = PathBuf::from(source);
            if !path.is_file() {
                bail!("Plugin source not found: {source}");
            }
            files.push(path);
        }
    }

    let mut installed: Vec<String> = Vec::new();
    for file in &files {
        println!("Installing '{}'...", file.display());
        match file.extension().and_then(|e| e.to_str()) {
            Some(PLUGIN_SUFFIX) => installed.push(install_bare(file, &plugin_dir)?),
            Some("zip") => installed.push(install_archived(file, &plugin_dir)?),
            _ => bail!("'{}' is not a .zip or .jar file", file.display()),
        }
    }

    let service_user = privileges::lookup_user(&settings.system.server_user)?;
    for name in &installed {
        let path = plugin_dir.join(name);
        fs::set_permissions(&path, fs::Permissions::from_mode(PLUGIN_MODE))?;
        let _root = privileges::try_elevate();
        storage::chown_recursive(&path, service_user.uid, service_user.gid)?;
    }

    if restart {
        lifecycle::notified_transition(
            settings,
            layout,
            instance,
            UnitAction::Restart,
            Some("Installing plugins."),
            false,
        )?;
        println!("Installed {}. Restarted server.", installed.join(", "));
    } else {
        println!(
            "Installed {}. Manual restart/reload required.",
            installed.join(", ")
        );
    }

    if autoupgrade {
        auto_uninstall(layout, instance, &installed, force, UpgradeTunables::default())?;
    }
    Ok(())
}

fn install_bare(source: &Path, plugin_dir: &Path) -> Result<String> {
    let name = source
        .file_name()
        .context("plugin file has no name")?
        .to_string_lossy()
        .into_owned();
    fs::copy(source, plugin_dir.join(&name))
        .with_context(|| format!("copying {}", source.display()))?;
    Ok(name)
}

/// Extract exactly one plugin from an archive. Several candidates require
/// an explicit choice; silently installing all of them is how servers end
/// up with stray libraries.
fn install_archived(source: &Path, plugin_dir: &Path) -> Result<String> {
    let file = fs::File::open(source)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let candidates: Vec<String> = (0..archive.len())
        .filter_map(|index| {
            let entry = archive.by_index(index).ok()?;
            let name = entry.enclosed_name()?;
            if name.extension().and_then(|e| e.to_str()) == Some(PLUGIN_SUFFIX) {
                Some(entry.name().to_string())
            } else {
                None
            }
        })
        .collect();

    let chosen = match candidates.len() {
        0 => bail!("No plugin found inside '{}'", source.display()),
        1 => candidates[0].clone(),
        _ => {
            let picked = Select::new()
                .with_prompt(format!(
                    "'{}' contains several plugins, pick one",
                    source.display()
                ))
                .items(&candidates)
                .default(0)
                .interact()?;
            candidates[picked].clone()
        }
    };

    let mut entry = archive.by_name(&chosen)?;
    let plugin_name = Path::new(&chosen)
        .file_name()
        .context("archive entry has no filename")?
        .to_string_lossy()
        .into_owned();
    let mut out = fs::File::create(plugin_dir.join(&plugin_name))?;
    io::copy(&mut entry, &mut out)?;
    Ok(plugin_name)
}

/// Remove plugins whose filename contains any of the search terms
/// (case-insensitive).
pub fn uninstall(
    settings: &Settings,
    layout: &Layout,
    instance: &str,
    terms: &[String],
    restart: bool,
    force: bool,
) -> Result<()> {
    let plugin_dir = plugin_dir_checked(layout, instance)?;
    let installed = installed_plugins(layout, instance)?;

    let mut resolved: Vec<String> = installed
        .into_iter()
        .filter(|name| {
            let lowered = name.to_lowercase();
            terms.iter().any(|term| lowered.contains(&term.to_lowercase()))
        })
        .collect();
    resolved.sort();
    resolved.dedup();

    if resolved.is_empty() {
        println!("No plugins found to uninstall.");
        return Ok(());
    }

    println!("The following plugins will be removed:");
    println!("  {}", resolved.join(", "));
    if !force && !lifecycle::confirm("Is this ok?")? {
        println!("Cancelled.");
        return Ok(());
    }

    let unit = ServiceUnit::new(settings, instance);
    let was_active = restart && unit.is_active()?;
    if was_active {
        lifecycle::notified_transition(
            settings,
            layout,
            instance,
            UnitAction::Stop,
            Some("Removing plugins."),
            false,
        )?;
    }
    for name in &resolved {
        fs::remove_file(plugin_dir.join(name))?;
    }
    if was_active {
        lifecycle::notified_transition(settings, layout, instance, UnitAction::Start, None, false)?;
    }
    println!("Removed {}.", resolved.join(", "));
    Ok(())
}

/// Offer to remove plugins that look like older versions of the ones just
/// installed. Purely lexical; a plugin with no reasonably similar new
/// counterpart is never proposed.
pub fn auto_uninstall(
    layout: &Layout,
    instance: &str,
    new_plugins: &[String],
    force: bool,
    tunables: UpgradeTunables,
) -> Result<()> {
    let plugin_dir = plugin_dir_checked(layout, instance)?;
    let old_installed: Vec<String> = installed_plugins(layout, instance)?
        .into_iter()
        .filter(|name| !new_plugins.contains(name))
        .collect();

    let matcher = NormalizedLevenshtein;
    let mut resolved: Vec<String> = Vec::new();
    for name in new_plugins {
        for candidate in close_matches(
            name,
            &old_installed,
            &matcher,
            tunables.threshold,
            tunables.max_matches,
        ) {
            if !resolved.contains(&candidate) {
                resolved.push(candidate);
            }
        }
    }

    if resolved.is_empty() {
        println!("No similar plugins found to uninstall.");
        return Ok(());
    }

    println!("The following plugins seem to be old versions of the plugin(s) just installed:");
    println!("  {}", resolved.join(", "));
    if !force && !lifecycle::confirm("Remove them?")? {
        println!("Cancelled.");
        return Ok(());
    }
    for name in &resolved {
        fs::remove_file(plugin_dir.join(name))?;
    }
    println!("Automatically removed {}.", resolved.join(", "));
    Ok(())
}

/// `ls plugins` view: every instance with its plugin support and contents.
pub fn list_plugins(layout: &Layout, filter: Option<&str>) -> Result<Vec<String>> {
    let mut rows = Vec::new();
    for instance in storage::list_instances(layout)? {
        let plugins = installed_plugins(layout, &instance).unwrap_or_default();
        let support = if layout.plugin_dir(&instance).is_dir() {
            "supported"
        } else {
            "not supported"
        };
        let row = format!("{instance:<16} {support:^14} {}", plugins.join(", "));
        if filter.is_none_or(|f| row.contains(f)) {
            rows.push(row);
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout_with_plugins(temp: &TempDir, instance: &str, names: &[&str]) -> Layout {
        let layout = Layout::new(temp.path().to_path_buf());
        let plugin_dir = layout.plugin_dir(instance);
        storage::create_dirs(&plugin_dir).unwrap();
        for name in names {
            fs::write(plugin_dir.join(name), b"jar").unwrap();
        }
        layout
    }

    #[test]
    fn ratio_is_one_for_identical_names() {
        let matcher = NormalizedLevenshtein;
        assert_eq!(matcher.ratio("EssentialsX-2.20.1.jar", "EssentialsX-2.20.1.jar"), 1.0);
    }

    #[test]
    fn ratio_is_high_for_version_bumps() {
        let matcher = NormalizedLevenshtein;
        let ratio = matcher.ratio("EssentialsX-2.20.1.jar", "EssentialsX-2.19.7.jar");
        assert!(ratio > 0.8, "got {ratio}");
    }

    #[test]
    fn ratio_is_low_for_unrelated_plugins() {
        let matcher = NormalizedLevenshtein;
        let ratio = matcher.ratio("WorldEdit-7.2.jar", "Dynmap-3.6.jar");
        assert!(ratio < 0.6, "got {ratio}");
    }

    #[test]
    fn close_matches_honors_threshold_and_cap() {
        let matcher = NormalizedLevenshtein;
        let pool = vec![
            "EssentialsX-2.19.7.jar".to_string(),
            "EssentialsX-2.19.0.jar".to_string(),
            "EssentialsX-2.18.2.jar".to_string(),
            "Dynmap-3.6.jar".to_string(),
        ];

        let matches = close_matches("EssentialsX-2.20.1.jar", &pool, &matcher, 0.6, 2);

        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|name| name.starts_with("EssentialsX")));
    }

    #[test]
    fn close_matches_returns_nothing_for_dissimilar_pool() {
        let matcher = NormalizedLevenshtein;
        let pool = vec!["Dynmap-3.6.jar".to_string()];
        assert!(close_matches("WorldEdit-7.2.jar", &pool, &matcher, 0.6, 2).is_empty());
    }

    #[test]
    fn auto_uninstall_removes_only_similar_old_versions() {
        let temp = TempDir::new().unwrap();
        let layout = layout_with_plugins(
            &temp,
            "testserver",
            &[
                "EssentialsX-2.19.7.jar",
                "EssentialsX-2.20.1.jar",
                "Dynmap-3.6.jar",
            ],
        );

        auto_uninstall(
            &layout,
            "testserver",
            &["EssentialsX-2.20.1.jar".to_string()],
            true,
            UpgradeTunables::default(),
        )
        .unwrap();

        let remaining = installed_plugins(&layout, "testserver").unwrap();
        assert_eq!(remaining, vec!["Dynmap-3.6.jar", "EssentialsX-2.20.1.jar"]);
    }

    #[test]
    fn auto_uninstall_keeps_everything_without_counterparts() {
        let temp = TempDir::new().unwrap();
        let layout = layout_with_plugins(&temp, "testserver", &["Dynmap-3.6.jar"]);

        auto_uninstall(
            &layout,
            "testserver",
            &["WorldEdit-7.2.jar".to_string()],
            true,
            UpgradeTunables::default(),
        )
        .unwrap();

        let remaining = installed_plugins(&layout, "testserver").unwrap();
        assert_eq!(remaining, vec!["Dynmap-3.6.jar"]);
    }

    #[test]
    fn installed_plugins_requires_plugin_support() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path().to_path_buf());
        storage::create_dirs(&layout.instance_dir("bare")).unwrap();
        let err = installed_plugins(&layout, "bare").unwrap_err();
        assert!(err.to_string().contains("does not support plugins"));
    }

    #[test]
    fn archive_with_single_plugin_installs_without_prompt() {
        let temp = TempDir::new().unwrap();
        let layout = layout_with_plugins(&temp, "testserver", &[]);
        let zip_path = temp.path().join("bundle.zip");
        let mut writer = zip::ZipWriter::new(fs::File::create(&zip_path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("docs/readme.txt", options).unwrap();
        use std::io::Write as _;
        writer.write_all(b"docs").unwrap();
        writer.start_file("release/MyPlugin-1.0.jar", options).unwrap();
        writer.write_all(b"jar").unwrap();
        writer.finish().unwrap();

        let name = install_archived(&zip_path, &layout.plugin_dir("testserver")).unwrap();

        assert_eq!(name, "MyPlugin-1.0.jar");
        assert!(layout.plugin_dir("testserver").join(name).is_file());
    }

    #[test]
    fn archive_without_plugins_is_an_error() {
        let temp = TempDir::new().unwrap();
        let layout = layout_with_plugins(&temp, "testserver", &[]);
        let zip_path = temp.path().join("empty.zip");
        let mut writer = zip::ZipWriter::new(fs::File::create(&zip_path).unwrap());
        writer
            .start_file("readme.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.finish().unwrap();

        assert!(install_archived(&zip_path, &layout.plugin_dir("testserver")).is_err());
    }
}
