// Install the deployer's SSH key on a list of hosts

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use appdeployer_lib::config::{load_config, ProvisionConfig};
use appdeployer_lib::provision::{self, ProvisionReport, RunOptions, SshProvisioner};
use appdeployer_lib::ssh::{AutoAccept, AutoReject, ConsolePrompt, HostKeyPrompt, InstallOutcome};

#[derive(Parser)]
#[command(name = "appdeployer")]
#[command(about = "Provision SSH key access on deployment targets")]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma-separated target hosts
    #[arg(long)]
    hosts: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(short, long)]
    username: Option<String>,

    #[arg(long, env = "APPDEPLOYER_SSH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Remote authorized_keys file
    #[arg(long)]
    authorized_keys_path: Option<String>,

    #[arg(long)]
    private_key_path: Option<String>,

    #[arg(long)]
    public_key_path: Option<String>,

    #[arg(long)]
    known_hosts_path: Option<String>,

    /// Record unknown host keys after confirmation (false: accept without recording)
    #[arg(long)]
    strict_host_key_checking: Option<bool>,

    /// Dial, authentication and remote command timeout
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// RSA key size for a newly generated key
    #[arg(long)]
    key_bits: Option<usize>,

    /// Hosts provisioned at the same time
    #[arg(long)]
    concurrency: Option<usize>,

    /// Keep going after a host fails
    #[arg(long)]
    continue_on_error: bool,

    /// Trust unknown host keys without asking
    #[arg(long, conflicts_with = "no_prompt")]
    yes: bool,

    /// Reject unknown host keys without asking
    #[arg(long)]
    no_prompt: bool,
}

impl Args {
    fn apply(self, config: &mut ProvisionConfig) {
        if let Some(hosts) = self.hosts {
            config.hosts = hosts;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(username) = self.username {
            config.username = username;
        }
        if let Some(password) = self.password {
            config.password = password;
        }
        if let Some(path) = self.authorized_keys_path {
            config.authorized_keys_path = path;
        }
        if let Some(path) = self.private_key_path {
            config.private_key_path = path;
        }
        if let Some(path) = self.public_key_path {
            config.public_key_path = path;
        }
        if let Some(path) = self.known_hosts_path {
            config.known_hosts_path = path;
        }
        if let Some(strict) = self.strict_host_key_checking {
            config.strict_host_key_checking = strict;
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout_secs = secs;
        }
        if let Some(bits) = self.key_bits {
            config.key_bits = bits;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if self.continue_on_error {
            config.continue_on_error = true;
        }
    }

    fn prompt(&self) -> Arc<dyn HostKeyPrompt> {
        if self.yes {
            Arc::new(AutoAccept)
        } else if self.no_prompt {
            Arc::new(AutoReject)
        } else {
            Arc::new(ConsolePrompt)
        }
    }
}

fn print_summary(report: &ProvisionReport) {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(InstallOutcome::Installed) => println!("{}: key installed", outcome.host),
            Ok(InstallOutcome::AlreadyPresent) => println!("{}: key already present", outcome.host),
            Err(e) => println!("{}: FAILED: {}", outcome.host, e),
        }
    }
    for host in &report.skipped {
        println!("{}: skipped", host);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    appdeployer_lib::init_logging();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match load_config(path).await {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => ProvisionConfig::default(),
    };
    let prompt = args.prompt();
    args.apply(&mut config);

    if let Err(e) = config.validate() {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    let provisioner = match SshProvisioner::from_config(&config, prompt) {
        Ok(p) => p,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight hosts");
            ctrl_c.cancel();
        }
    });

    let hosts = config.host_list();
    info!("Provisioning {} host(s)", hosts.len());

    match provision::run(&provisioner, &hosts, RunOptions::from(&config), &cancel).await {
        Ok(report) => {
            print_summary(&report);
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
