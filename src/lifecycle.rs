//! Instance lifecycle: creation, updates, configuration, rename/removal,
//! and the reconciled status model every user-facing surface reports.

use std::{
    fs,
    path::{Component, Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use bytesize::ByteSize;
use dialoguer::{Confirm, Input};

use crate::{
    console, privileges, probe,
    probe::ServerStatus,
    properties,
    service::{ServiceUnit, UnitAction},
    settings::Settings,
    storage::{self, Layout},
    web,
};

const PRE_START_TIMEOUT: Duration = Duration::from_secs(80);
const PRE_START_POLL: Duration = Duration::from_millis(250);
pub const MEMORY_KEY: &str = "MEM";

/// True operational state of an instance. The unit being `active` is not
/// enough to call a server running: the JVM may still be loading the world,
/// so an answering listener is what separates `Starting` from `Active`.
#[derive(Debug, Clone)]
pub enum InstanceState {
    Stopped,
    Starting,
    Active(ServerStatus),
}

impl InstanceState {
    pub fn label(&self) -> &'static str {
        match self {
            InstanceState::Stopped => "stopped",
            InstanceState::Starting => "starting",
            InstanceState::Active(_) => "active",
        }
    }
}

/// Pure derivation used by [`reconcile_status`]; kept separate so the
/// mapping is testable without systemd or a listener.
fn derive_state(unit_active: bool, probed: Option<ServerStatus>) -> InstanceState {
    if !unit_active {
        return InstanceState::Stopped;
    }
    match probed {
        Some(status) => InstanceState::Active(status),
        None => InstanceState::Starting,
    }
}

/// Combine unit state with a live listener probe.
pub fn reconcile_status(
    settings: &Settings,
    layout: &Layout,
    instance: &str,
) -> Result<InstanceState> {
    let unit = ServiceUnit::new(settings, instance);
    if !unit.is_active()? {
        return Ok(derive_state(false, None));
    }
    let port = server_port(layout, instance);
    Ok(derive_state(true, probe::status("localhost", port).ok()))
}

/// Configured listen port, falling back to the server default when the
/// properties file is missing or silent.
pub fn server_port(layout: &Layout, instance: &str) -> u16 {
    properties::read_file(&layout.server_properties(instance))
        .ok()
        .and_then(|props| props.get("server-port").and_then(|p| p.parse().ok()))
        .unwrap_or(probe::DEFAULT_PORT)
}

pub fn confirm(prompt: &str) -> Result<bool> {
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

/// Deletes a partially created instance directory unless disarmed. Holding
/// this across the fallible stretch of `create` keeps "never partially
/// exists" true on every error path, the declined EULA included.
struct CreateRollback {
    path: PathBuf,
    armed: bool,
}

impl CreateRollback {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CreateRollback {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = fs::remove_dir_all(&self.path) {
                tracing::error!(path = %self.path.display(), error = %err, "rollback failed");
            } else {
                tracing::info!(path = %self.path.display(), "rolled back partial instance");
            }
        }
    }
}

/// Create a new instance: directory, cached binary, first-run files, EULA
/// gate, config overrides. Returns the resolved version tag.
#[allow(clippy::too_many_arguments)]
pub fn create(
    settings: &Settings,
    layout: &Layout,
    instance: &str,
    source: &str,
    literal_url: bool,
    memory: Option<&str>,
    property_pairs: &[String],
    start: bool,
) -> Result<String> {
    let instance_dir = layout.instance_dir(instance);
    if instance_dir.exists() {
        bail!("Instance already exists: {}", instance_dir.display());
    }
    let overrides = properties::parse_pairs(property_pairs)?;
    let memory = memory.map(validated_memory).transpose()?;

    storage::create_dirs(&instance_dir)?;
    let mut rollback = CreateRollback::new(instance_dir.clone());

    let (jar_path, tag) = web::pull(layout, source, literal_url, true)?;
    let server_jar = layout.server_jar(instance);
    storage::symlink_file(&jar_path, &server_jar)?;

    // Most server binaries only write their default config files (the EULA
    // included) on first launch, so give it one supervised run.
    let finished = pre_start(
        settings,
        &server_jar,
        &instance_dir,
        Some(&instance_dir.join(storage::EULA_FILE)),
    )?;
    if !finished {
        tracing::warn!(instance, "first-run probe had to be killed");
    }

    if !accept_eula(&instance_dir)? {
        bail!("The EULA was declined");
    }

    if !overrides.is_empty() {
        properties::merge_into(&layout.server_properties(instance), &overrides)?;
    }
    if let Some(memory) = memory {
        properties::merge_into(
            &layout.env_file(instance, settings),
            &[(MEMORY_KEY.to_string(), memory)],
        )?;
    }

    let service_user = privileges::lookup_user(&settings.system.server_user)?;
    {
        let _root = privileges::try_elevate();
        storage::chown_recursive(&instance_dir, service_user.uid, service_user.gid)?;
    }

    rollback.disarm();
    println!("Configured and ready to start.");

    if start {
        let unit = ServiceUnit::new(settings, instance);
        unit.set_persistence(true)?;
        unit.set_status(UnitAction::Start)?;
    }
    Ok(tag)
}

fn validated_memory(memory: &str) -> Result<String> {
    memory
        .parse::<ByteSize>()
        .map_err(|err| anyhow::anyhow!("Invalid memory value '{memory}': {err}"))?;
    Ok(memory.to_string())
}

/// Launch the server binary directly (no unit) under the service account
/// and wait for it to either exit or produce `watch_file`. The watched file
/// triggers a graceful shutdown request; the timeout a hard kill.
pub fn pre_start(
    settings: &Settings,
    jar_path: &Path,
    work_dir: &Path,
    watch_file: Option<&Path>,
) -> Result<bool> {
    let service_user = privileges::lookup_user(&settings.system.server_user)?;
    let mut cmd = Command::new(&settings.tools.java);
    cmd.arg("-jar")
        .arg(jar_path)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    privileges::demote_child(&mut cmd, &service_user);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("launching {}", settings.tools.java))?;

    println!("Setting up config files...");
    let deadline = Instant::now() + PRE_START_TIMEOUT;
    let mut signaled = false;
    loop {
        if let Some(_status) = child.try_wait()? {
            return Ok(true);
        }
        if !signaled {
            if let Some(watch) = watch_file {
                if watch.exists() {
                    unsafe {
                        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
                    }
                    signaled = true;
                }
            }
        }
        if Instant::now() >= deadline {
            child.kill()?;
            child.wait()?;
            return Ok(false);
        }
        thread::sleep(PRE_START_POLL);
    }
}

/// Show the EULA and require an explicit answer. Accepting flips the flag
/// in place; declining leaves the file untouched and reports false.
pub fn accept_eula(instance_dir: &Path) -> Result<bool> {
    let eula_path = instance_dir.join(storage::EULA_FILE);
    if !eula_path.exists() {
        bail!("EULA not found: {}", eula_path.display());
    }

    let eula = properties::decode_latin1(&fs::read(&eula_path)?);
    for line in eula.lines().filter(|line| line.starts_with('#')) {
        println!("{}", line.trim_start_matches('#').trim());
    }

    let answer: String = Input::new()
        .with_prompt("Enter [true] to accept the EULA or [false] to abort")
        .validate_with(|input: &String| match input.trim() {
            "true" | "false" => Ok(()),
            _ => Err("Please type 'true' or 'false'"),
        })
        .interact_text()?;
    let accepted = answer.trim() == "true";

    if accepted {
        let flipped = eula.replace("eula=false", "eula=true");
        fs::write(&eula_path, properties::encode_latin1(&flipped)?)?;
    }
    Ok(accepted)
}

/// Start/stop/restart with an in-game heads-up. The broadcast is best
/// effort; the transition happens whether or not the players heard about
/// it. Persistence follows plain start/stop only, since a restart must
/// never change boot behavior.
pub fn notified_transition(
    settings: &Settings,
    layout: &Layout,
    instance: &str,
    action: UnitAction,
    message: Option<&str>,
    persistent: bool,
) -> Result<()> {
    let unit = ServiceUnit::new(settings, instance);

    if matches!(action, UnitAction::Stop | UnitAction::Restart) {
        if let InstanceState::Active(_) = reconcile_status(settings, layout, instance)? {
            let note = match message {
                Some(reason) => format!("Attention: Server {} imminent: {reason}", action.verb()),
                None => format!("Attention: Server {} imminent.", action.verb()),
            };
            if let Err(err) = console::broadcast(&unit, layout, instance, &note) {
                tracing::warn!(instance, error = %err, "could not notify players");
            }
        }
    }

    match action {
        UnitAction::Start if persistent => unit.set_persistence(true)?,
        UnitAction::Stop if persistent => unit.set_persistence(false)?,
        _ => {}
    }
    unit.set_status(action)?;
    Ok(())
}

/// Swap the instance binary for a newly resolved tag. The old jar is never
/// touched in place; the symlink flips atomically, so a server mid-shutdown
/// still reads the binary it was started from.
pub fn update(
    settings: &Settings,
    layout: &Layout,
    instance: &str,
    source: &str,
    literal_url: bool,
    allow_restart: bool,
) -> Result<String> {
    let instance_dir = layout.instance_dir(instance);
    if !instance_dir.is_dir() {
        bail!("Instance not found: {}", instance_dir.display());
    }

    let (jar_path, tag) = web::pull(layout, source, literal_url, false)?;
    storage::swap_symlink(&jar_path, &layout.server_jar(instance))?;

    if let InstanceState::Active(_) = reconcile_status(settings, layout, instance)? {
        if allow_restart {
            notified_transition(
                settings,
                layout,
                instance,
                UnitAction::Restart,
                Some(&format!("Updating to {tag}.")),
                false,
            )?;
        } else {
            println!("A manual restart is required to apply the update.");
        }
    }
    Ok(tag)
}

/// One staged config edit: the original path and its private working copy.
struct StagedEdit {
    original: PathBuf,
    staged: tempfile::NamedTempFile,
}

/// Apply property/memory merges and interactive edits. Every target is
/// edited on a private copy first; copies whose content hash still matches
/// the original are dropped, so a no-op edit can never bounce a server.
pub fn configure(
    settings: &Settings,
    layout: &Layout,
    instance: &str,
    property_pairs: &[String],
    memory: Option<&str>,
    edit_paths: &[String],
    restart: bool,
) -> Result<()> {
    let instance_dir = layout.instance_dir(instance);
    if !instance_dir.is_dir() {
        bail!("Instance not found: {}", instance_dir.display());
    }

    let mut edits: Vec<StagedEdit> = Vec::new();

    let overrides = properties::parse_pairs(property_pairs)?;
    if !overrides.is_empty() {
        let original = layout.server_properties(instance);
        let staged = stage_copy(&original)?;
        let mut props = properties::read_file(staged.path())?;
        props.merge(&overrides);
        properties::write_file(staged.path(), &props)?;
        edits.push(StagedEdit { original, staged });
    }

    if let Some(memory) = memory {
        let memory = validated_memory(memory)?;
        let original = layout.env_file(instance, settings);
        let staged = stage_copy(&original)?;
        properties::merge_into(staged.path(), &[(MEMORY_KEY.to_string(), memory)])?;
        edits.push(StagedEdit { original, staged });
    }

    for rel in edit_paths {
        let original = resolve_edit_path(&instance_dir, rel)?;
        let staged = stage_copy(&original)?;
        run_editor(&settings.tools.editor, staged.path())?;
        edits.push(StagedEdit { original, staged });
    }

    // Hash comparison decides what actually changed.
    let mut changed: Vec<StagedEdit> = Vec::new();
    for edit in edits {
        let before = if edit.original.exists() {
            Some(storage::file_sha256(&edit.original)?)
        } else {
            None
        };
        let after = storage::file_sha256(edit.staged.path())?;
        if before.as_deref() != Some(after.as_str()) {
            changed.push(edit);
        }
    }

    if changed.is_empty() {
        println!("No configuration changes.");
        return Ok(());
    }

    let unit = ServiceUnit::new(settings, instance);
    let bounce = restart && unit.is_active()?;
    if bounce {
        notified_transition(
            settings,
            layout,
            instance,
            UnitAction::Stop,
            Some("Updating configuration."),
            false,
        )?;
    }

    let service_user = privileges::lookup_user(&settings.system.server_user)?;
    let count = changed.len();
    for edit in changed {
        edit.staged
            .persist(&edit.original)
            .map_err(|err| err.error)
            .with_context(|| format!("replacing {}", edit.original.display()))?;
        let _root = privileges::try_elevate();
        storage::chown_recursive(&edit.original, service_user.uid, service_user.gid)?;
    }

    if bounce {
        notified_transition(settings, layout, instance, UnitAction::Start, None, false)?;
    }
    println!("Updated {count} file(s).");
    Ok(())
}

/// Working copy of `original` next to it, so the final rename stays on one
/// filesystem. A missing original stages as an empty file.
fn stage_copy(original: &Path) -> Result<tempfile::NamedTempFile> {
    let dir = original
        .parent()
        .context("config path has no parent directory")?;
    let staged = tempfile::Builder::new()
        .prefix(".craftctl-edit")
        .tempfile_in(dir)?;
    if original.exists() {
        fs::copy(original, staged.path())
            .with_context(|| format!("staging {}", original.display()))?;
    }
    Ok(staged)
}

fn resolve_edit_path(instance_dir: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute()
        || rel_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        bail!("Config path must stay inside the instance directory: {rel}");
    }
    Ok(instance_dir.join(rel_path))
}

fn run_editor(editor: &str, path: &Path) -> Result<()> {
    let status = Command::new(editor)
        .arg(path)
        .status()
        .with_context(|| format!("launching editor '{editor}'"))?;
    if !status.success() {
        bail!("Editor exited with {status}");
    }
    Ok(())
}

/// The unit must be both stopped and non-persistent before its name can
/// change, otherwise systemd keeps a reference to a directory that no
/// longer exists.
pub fn rename(
    settings: &Settings,
    layout: &Layout,
    instance: &str,
    new_name: &str,
) -> Result<()> {
    let source = layout.instance_dir(instance);
    if !source.is_dir() {
        bail!("Instance not found: {}", source.display());
    }
    let dest = layout.instance_dir(new_name);
    if dest.exists() {
        bail!("Instance already exists: {}", dest.display());
    }
    ensure_inactive_and_disabled(settings, instance)?;
    fs::rename(&source, &dest)
        .with_context(|| format!("renaming {} to {}", source.display(), dest.display()))?;
    Ok(())
}

/// Delete an instance and everything in it.
pub fn remove(settings: &Settings, layout: &Layout, instance: &str, force: bool) -> Result<()> {
    let instance_dir = layout.instance_dir(instance);
    if !instance_dir.is_dir() {
        bail!("Instance not found: {}", instance_dir.display());
    }
    ensure_inactive_and_disabled(settings, instance)?;

    if !force
        && !confirm(&format!(
            "Are you absolutely sure you want to remove the instance '{instance}'?"
        ))?
    {
        println!("Cancelled.");
        return Ok(());
    }
    fs::remove_dir_all(&instance_dir)?;
    Ok(())
}

fn ensure_inactive_and_disabled(settings: &Settings, instance: &str) -> Result<()> {
    let unit = ServiceUnit::new(settings, instance);
    if unit.is_active()? {
        bail!("The server is still running");
    }
    if unit.is_enabled()? {
        bail!("The server is still persistent (start-at-boot is enabled)");
    }
    Ok(())
}

/// Maintenance shell as the service account, in the instance directory (or
/// the service home when no instance is given).
pub fn shell(settings: &Settings, layout: &Layout, instance: Option<&str>) -> Result<()> {
    let service_user = privileges::lookup_user(&settings.system.server_user)?;
    let work_dir = match instance {
        Some(name) => {
            let dir = layout.instance_dir(name);
            if !dir.is_dir() {
                bail!("Instance not found: {}", dir.display());
            }
            dir
        }
        None => layout.home().to_path_buf(),
    };

    let mut cmd = Command::new(&settings.tools.shell);
    cmd.current_dir(&work_dir)
        .env("HOME", layout.home())
        .env("USER", &service_user.name);
    privileges::demote_child(&mut cmd, &service_user);
    let status = cmd
        .status()
        .with_context(|| format!("launching {}", settings.tools.shell))?;
    if !status.success() {
        bail!("Shell exited with {status}");
    }
    Ok(())
}

/// One row of the `ls instances` / `status` output.
#[derive(Debug)]
pub struct InstanceRow {
    pub name: String,
    pub state: InstanceState,
    pub persistent: bool,
}

pub fn instance_rows(
    settings: &Settings,
    layout: &Layout,
    filter: Option<&str>,
) -> Result<Vec<InstanceRow>> {
    let mut rows = Vec::new();
    for name in storage::list_instances(layout)? {
        if let Some(filter) = filter {
            if !name.contains(filter) {
                continue;
            }
        }
        rows.push(instance_row(settings, layout, &name)?);
    }
    Ok(rows)
}

pub fn instance_row(settings: &Settings, layout: &Layout, instance: &str) -> Result<InstanceRow> {
    let unit = ServiceUnit::new(settings, instance);
    Ok(InstanceRow {
        name: instance.to_string(),
        state: reconcile_status(settings, layout, instance)?,
        persistent: unit.is_enabled()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_status() -> ServerStatus {
        ServerStatus {
            online: 3,
            max: 20,
            protocol: 763,
            version: "1.20.1".to_string(),
        }
    }

    #[test]
    fn inactive_unit_is_stopped_regardless_of_probe() {
        assert!(matches!(derive_state(false, None), InstanceState::Stopped));
        // A stale listener on the port must not override the unit.
        assert!(matches!(
            derive_state(false, Some(sample_status())),
            InstanceState::Stopped
        ));
    }

    #[test]
    fn active_unit_without_listener_is_starting() {
        assert!(matches!(derive_state(true, None), InstanceState::Starting));
    }

    #[test]
    fn active_unit_with_listener_is_active() {
        match derive_state(true, Some(sample_status())) {
            InstanceState::Active(status) => assert_eq!(status.online, 3),
            other => panic!("expected active, got {other:?}"),
        }
    }

    #[test]
    fn server_port_reads_properties_with_default() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path().to_path_buf());
        storage::create_dirs(&layout.instance_dir("testserver")).unwrap();

        assert_eq!(server_port(&layout, "testserver"), probe::DEFAULT_PORT);

        fs::write(
            layout.server_properties("testserver"),
            b"server-port=25599\n",
        )
        .unwrap();
        assert_eq!(server_port(&layout, "testserver"), 25599);
    }

    #[test]
    fn memory_strings_are_validated() {
        assert_eq!(validated_memory("2G").unwrap(), "2G");
        assert_eq!(validated_memory("512M").unwrap(), "512M");
        assert!(validated_memory("lots").is_err());
    }

    #[test]
    fn rollback_guard_removes_directory_unless_disarmed() {
        let temp = TempDir::new().unwrap();
        let doomed = temp.path().join("doomed");
        fs::create_dir_all(&doomed).unwrap();
        drop(CreateRollback::new(doomed.clone()));
        assert!(!doomed.exists());

        let kept = temp.path().join("kept");
        fs::create_dir_all(&kept).unwrap();
        let mut guard = CreateRollback::new(kept.clone());
        guard.disarm();
        drop(guard);
        assert!(kept.exists());
    }

    #[test]
    fn edit_paths_may_not_escape_the_instance() {
        let base = Path::new("/srv/instances/testserver");
        assert!(resolve_edit_path(base, "server.properties").is_ok());
        assert!(resolve_edit_path(base, "config/paper.yml").is_ok());
        assert!(resolve_edit_path(base, "../other/server.properties").is_err());
        assert!(resolve_edit_path(base, "/etc/passwd").is_err());
    }

    #[test]
    fn stage_copy_matches_original_content() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("server.properties");
        fs::write(&original, b"motd=hi\n").unwrap();

        let staged = stage_copy(&original).unwrap();

        assert_eq!(
            storage::file_sha256(&original).unwrap(),
            storage::file_sha256(staged.path()).unwrap()
        );
    }

    #[test]
    fn stage_copy_of_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("jvm-env");
        let staged = stage_copy(&original).unwrap();
        assert_eq!(staged.path().metadata().unwrap().len(), 0);
    }

    fn local_settings() -> Settings {
        let mut settings = Settings::default();
        settings.system.server_user = privileges::current_user().unwrap().name;
        settings
    }

    #[test]
    fn configure_merges_and_noop_leaves_file_alone() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path().to_path_buf());
        let settings = local_settings();
        storage::create_dirs(&layout.instance_dir("testserver")).unwrap();
        fs::write(layout.server_properties("testserver"), b"motd=old\npvp=true\n").unwrap();

        configure(
            &settings,
            &layout,
            "testserver",
            &["motd=new".to_string()],
            None,
            &[],
            false,
        )
        .unwrap();

        let props = properties::read_file(&layout.server_properties("testserver")).unwrap();
        assert_eq!(props.get("motd"), Some("new"));
        assert_eq!(props.get("pvp"), Some("true"));

        // Re-applying the same value hashes equal and must not rewrite.
        let before = storage::file_sha256(&layout.server_properties("testserver")).unwrap();
        configure(
            &settings,
            &layout,
            "testserver",
            &["motd=new".to_string()],
            None,
            &[],
            false,
        )
        .unwrap();
        let after = storage::file_sha256(&layout.server_properties("testserver")).unwrap();
        assert_eq!(before, after);

        // No staged working copies may be left behind.
        let leftovers: Vec<_> = fs::read_dir(layout.instance_dir("testserver"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".craftctl-edit")
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn configure_writes_memory_to_env_file() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path().to_path_buf());
        let settings = local_settings();
        storage::create_dirs(&layout.instance_dir("testserver")).unwrap();

        configure(&settings, &layout, "testserver", &[], Some("2G"), &[], false).unwrap();

        let env = properties::read_file(&layout.env_file("testserver", &settings)).unwrap();
        assert_eq!(env.get(MEMORY_KEY), Some("2G"));
    }
}
