use std::{io, path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use craftctl::{
    console, lifecycle,
    privileges::{self, Identity},
    service::{ServiceUnit, UnitAction},
    settings::{self, Settings},
    storage::{self, Layout},
    plugins, web,
};

#[derive(Debug, Parser)]
#[command(
    name = "craftctl",
    version,
    about = "Manage systemd-supervised Minecraft server instances"
)]
struct Cli {
    /// Print the full error chain instead of a one-line summary
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Create a new server instance
    Create {
        instance: String,
        /// Server tag (`type:version[:build]`) or, with --url, a direct URL
        source: String,
        #[arg(short = 'u', long)]
        url: bool,
        /// JVM heap, e.g. 2G or 512M
        #[arg(short = 'm', long)]
        memory: Option<String>,
        /// server.properties overrides as KEY=VALUE
        #[arg(short = 'p', long = "property", value_name = "KEY=VALUE")]
        properties: Vec<String>,
        /// Start (and enable) the instance right away
        #[arg(short = 's', long)]
        start: bool,
    },
    /// Start a server instance
    Start {
        instance: String,
        /// Also enable start-at-boot
        #[arg(short = 'p', long)]
        persistent: bool,
        /// Reason shown to players
        #[arg(short = 'm', long)]
        message: Option<String>,
    },
    /// Stop a server instance, warning players first
    Stop {
        instance: String,
        /// Also disable start-at-boot
        #[arg(short = 'p', long)]
        persistent: bool,
        #[arg(short = 'm', long)]
        message: Option<String>,
    },
    /// Restart a server instance, warning players first
    Restart {
        instance: String,
        #[arg(short = 'm', long)]
        message: Option<String>,
    },
    /// Swap the instance binary for another version
    Update {
        instance: String,
        source: String,
        #[arg(short = 'u', long)]
        url: bool,
        /// Restart an active server to apply the update
        #[arg(short = 'r', long)]
        restart: bool,
    },
    /// Change instance configuration
    Config {
        instance: String,
        #[arg(short = 'p', long = "property", value_name = "KEY=VALUE")]
        properties: Vec<String>,
        #[arg(short = 'm', long)]
        memory: Option<String>,
        /// Open these instance files in the configured editor
        #[arg(short = 'e', long = "edit", value_name = "FILE")]
        edit: Vec<String>,
        /// Restart an active server if anything actually changed
        #[arg(short = 'r', long)]
        restart: bool,
    },
    /// Show one instance's reconciled status
    Status { instance: String },
    /// List instances, cached jars or plugins
    Ls {
        #[arg(value_enum, default_value_t = ListTarget::Instances)]
        what: ListTarget,
        #[arg(short = 'f', long)]
        filter: Option<String>,
    },
    /// Download a server binary into the cache
    Pull {
        source: String,
        #[arg(short = 'u', long)]
        url: bool,
    },
    /// Rename a stopped, non-persistent instance
    Rename { instance: String, new_name: String },
    /// Remove an instance permanently
    Rm {
        instance: String,
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Remove a cached server jar (or `all`)
    Rmj {
        tag: String,
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Export an instance to a zip archive
    Export {
        instance: String,
        /// Compress instead of just storing
        #[arg(short = 'c', long)]
        compress: bool,
        /// Only include world data
        #[arg(short = 'w', long = "world-only")]
        world_only: bool,
        #[arg(short = 'o', long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Import a previously exported archive as a new instance
    Import {
        archive: PathBuf,
        /// Instance name (defaults to the archive's stem)
        #[arg(short = 'n', long)]
        name: Option<String>,
    },
    /// Install plugins from files, archives or URLs
    Install {
        instance: String,
        #[arg(required = true)]
        sources: Vec<String>,
        #[arg(short = 'r', long)]
        restart: bool,
        /// Offer to remove older versions of the installed plugins
        #[arg(short = 'a', long)]
        autoupgrade: bool,
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Uninstall plugins matching the search terms
    Uninstall {
        instance: String,
        #[arg(required = true)]
        terms: Vec<String>,
        #[arg(short = 'r', long)]
        restart: bool,
        #[arg(short = 'f', long)]
        force: bool,
    },
    /// Run a command on the server console and echo the response
    Exec {
        instance: String,
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Attach to the server console
    Attach { instance: String },
    /// Open a maintenance shell as the service account
    Shell { instance: Option<String> },
    /// Show the tail of an instance's logs
    Logs {
        instance: String,
        /// Line count; 0 prints all of latest.log
        #[arg(short = 'n', long, default_value_t = 25)]
        lines: usize,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ListTarget {
    Instances,
    Jars,
    Plugins,
}

impl Command {
    fn action(&self) -> &'static str {
        match self {
            Command::Create { .. } => "create",
            Command::Start { .. } => "start",
            Command::Stop { .. } => "stop",
            Command::Restart { .. } => "restart",
            Command::Update { .. } => "update",
            Command::Config { .. } => "config",
            Command::Status { .. } => "status",
            Command::Ls { .. } => "ls",
            Command::Pull { .. } => "pull",
            Command::Rename { .. } => "rename",
            Command::Rm { .. } => "rm",
            Command::Rmj { .. } => "rmj",
            Command::Export { .. } => "export",
            Command::Import { .. } => "import",
            Command::Install { .. } => "install",
            Command::Uninstall { .. } => "uninstall",
            Command::Exec { .. } => "exec",
            Command::Attach { .. } => "attach",
            Command::Shell { .. } => "shell",
            Command::Logs { .. } => "logs",
        }
    }

    /// Minimum real identity the command needs to start with. Commands that
    /// only touch the init system when a restart flag is passed escalate
    /// conditionally.
    fn required_identity(&self) -> Identity {
        match self {
            Command::Create { .. }
            | Command::Start { .. }
            | Command::Stop { .. }
            | Command::Restart { .. }
            | Command::Rename { .. }
            | Command::Rm { .. }
            | Command::Import { .. } => Identity::Root,
            Command::Update { restart, .. }
            | Command::Config { restart, .. }
            | Command::Install { restart, .. }
            | Command::Uninstall { restart, .. } => {
                if *restart {
                    Identity::Root
                } else {
                    Identity::Service
                }
            }
            Command::Status { .. }
            | Command::Ls { .. }
            | Command::Pull { .. }
            | Command::Rmj { .. }
            | Command::Export { .. }
            | Command::Exec { .. }
            | Command::Attach { .. }
            | Command::Shell { .. }
            | Command::Logs { .. } => Identity::Service,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = settings::load();

    let action = cli.command.action();
    match dispatch(cli.command, &settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if was_interrupted(&err) {
                eprintln!("Interrupted.");
                return ExitCode::from(130);
            }
            if cli.verbose {
                eprintln!("Unable to {action}: {err:?}");
            } else {
                eprintln!("Unable to {action}: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn dispatch(command: Command, settings: &Settings) -> anyhow::Result<()> {
    privileges::ensure_privilege(command.required_identity(), settings)?;
    let layout = Layout::for_settings(settings)?;

    // After the sudo re-exec the real identity is usually root; the bulk of
    // every operation still runs with the service account's effective ids.
    // The few root-only calls re-elevate themselves in scope.
    let _bulk = if privileges::real_uid() == 0 {
        let service_user = privileges::lookup_user(&settings.system.server_user)?;
        Some(privileges::run_as_user(&service_user)?)
    } else {
        None
    };

    match command {
        Command::Create {
            instance,
            source,
            url,
            memory,
            properties,
            start,
        } => {
            let tag = lifecycle::create(
                settings,
                &layout,
                &instance,
                &source,
                url,
                memory.as_deref(),
                &properties,
                start,
            )?;
            println!("Created instance '{instance}' ({tag}).");
        }
        Command::Start {
            instance,
            persistent,
            message,
        } => {
            lifecycle::notified_transition(
                settings,
                &layout,
                &instance,
                UnitAction::Start,
                message.as_deref(),
                persistent,
            )?;
            println!("Started '{instance}'.");
        }
        Command::Stop {
            instance,
            persistent,
            message,
        } => {
            lifecycle::notified_transition(
                settings,
                &layout,
                &instance,
                UnitAction::Stop,
                message.as_deref(),
                persistent,
            )?;
            println!("Stopped '{instance}'.");
        }
        Command::Restart { instance, message } => {
            lifecycle::notified_transition(
                settings,
                &layout,
                &instance,
                UnitAction::Restart,
                message.as_deref(),
                false,
            )?;
            println!("Restarted '{instance}'.");
        }
        Command::Update {
            instance,
            source,
            url,
            restart,
        } => {
            let tag = lifecycle::update(settings, &layout, &instance, &source, url, restart)?;
            println!("Updated '{instance}' to {tag}.");
        }
        Command::Config {
            instance,
            properties,
            memory,
            edit,
            restart,
        } => {
            lifecycle::configure(
                settings,
                &layout,
                &instance,
                &properties,
                memory.as_deref(),
                &edit,
                restart,
            )?;
        }
        Command::Status { instance } => {
            print_status(settings, &layout, &instance)?;
        }
        Command::Ls { what, filter } => match what {
            ListTarget::Instances => {
                let rows = lifecycle::instance_rows(settings, &layout, filter.as_deref())?;
                print_instance_table(&rows);
            }
            ListTarget::Jars => {
                for tag in storage::list_jars(&layout, filter.as_deref())? {
                    println!("{tag}");
                }
            }
            ListTarget::Plugins => {
                println!("{:<16} {:^14} {}", "Instance", "Plugins", "Installed");
                for row in plugins::list_plugins(&layout, filter.as_deref())? {
                    println!("{row}");
                }
            }
        },
        Command::Pull { source, url } => {
            let (path, tag) = web::pull(&layout, &source, url, true)?;
            println!("Pulled '{tag}' to {}.", path.display());
        }
        Command::Rename { instance, new_name } => {
            lifecycle::rename(settings, &layout, &instance, &new_name)?;
            println!("Renamed '{instance}' to '{new_name}'.");
        }
        Command::Rm { instance, force } => {
            lifecycle::remove(settings, &layout, &instance, force)?;
        }
        Command::Rmj { tag, force } => {
            storage::remove_jar(&layout, &tag, force)?;
        }
        Command::Export {
            instance,
            compress,
            world_only,
            output,
        } => {
            let path = storage::export(&layout, &instance, output, compress, world_only)?;
            println!("Exported '{instance}' to {}.", path.display());
        }
        Command::Import { archive, name } => {
            let name = match name {
                Some(name) => name,
                None => archive
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow::anyhow!("Cannot derive a name from the archive"))?,
            };
            let dest = storage::import(&layout, &archive, &name)?;
            let service_user = privileges::lookup_user(&settings.system.server_user)?;
            let _root = privileges::try_elevate();
            storage::chown_recursive(&dest, service_user.uid, service_user.gid)?;
            println!("Imported '{name}' from {}.", archive.display());
        }
        Command::Install {
            instance,
            sources,
            restart,
            autoupgrade,
            force,
        } => {
            plugins::install(
                settings,
                &layout,
                &instance,
                &sources,
                restart,
                autoupgrade,
                force,
            )?;
        }
        Command::Uninstall {
            instance,
            terms,
            restart,
            force,
        } => {
            plugins::uninstall(settings, &layout, &instance, &terms, restart, force)?;
        }
        Command::Exec { instance, command } => {
            let unit = ServiceUnit::new(settings, &instance);
            console::send(&unit, &layout, &instance, &command, true)?;
        }
        Command::Attach { instance } => {
            let unit = ServiceUnit::new(settings, &instance);
            console::attach(&unit, &instance)?;
        }
        Command::Shell { instance } => {
            lifecycle::shell(settings, &layout, instance.as_deref())?;
        }
        Command::Logs { instance, lines } => {
            for line in storage::tail_logs(&layout, &instance, lines)? {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn print_status(
    settings: &Settings,
    layout: &Layout,
    instance: &str,
) -> anyhow::Result<()> {
    let row = lifecycle::instance_row(settings, layout, instance)?;
    println!("Instance:   {}", row.name);
    println!("Status:     {}", row.state.label());
    println!("Persistent: {}", if row.persistent { "yes" } else { "no" });
    if let lifecycle::InstanceState::Active(status) = &row.state {
        println!("Players:    {}/{}", status.online, status.max);
        println!("Version:    {} (protocol {})", status.version, status.protocol);
    }
    Ok(())
}

fn print_instance_table(rows: &[lifecycle::InstanceRow]) {
    if rows.is_empty() {
        println!("No instances were found.");
        return;
    }
    println!(
        "{:<16} {:<10} {:<10} {:<16} {}",
        "Name", "Status", "Players", "Version", "Persistent"
    );
    for row in rows {
        let (players, version) = match &row.state {
            lifecycle::InstanceState::Active(status) => (
                format!("{}/{}", status.online, status.max),
                status.version.clone(),
            ),
            _ => ("-".to_string(), "-".to_string()),
        };
        println!(
            "{:<16} {:<10} {:<10} {:<16} {}",
            row.name,
            row.state.label(),
            players,
            version,
            if row.persistent { "yes" } else { "no" }
        );
    }
}

fn was_interrupted(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == io::ErrorKind::Interrupted)
    })
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}
