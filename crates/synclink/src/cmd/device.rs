use synclink_device::{AgentConfig, Collaborators, DeviceAgent};
use synclink_peer::{JsonSettingsStore, LinkSettings, SettingsStore};
use synclink_proto::AuthToken;
use tracing::info;

use crate::cmd::{parse_duration, DeviceArgs};
use crate::exit::{device_error, io_error, peer_error, CliResult, SUCCESS};
use crate::output::{print_link_status, OutputFormat};

pub async fn run(args: DeviceArgs, format: OutputFormat) -> CliResult<i32> {
    let run_for = args.run_for.as_deref().map(parse_duration).transpose()?;
    let settings = resolve_settings(&args)?;

    if args.save_settings {
        if let Some(path) = &args.settings {
            JsonSettingsStore::new(path)
                .save(&settings)
                .map_err(|err| peer_error("failed to save settings", err))?;
            info!(path = %path.display(), "settings saved");
        }
    }

    std::fs::create_dir_all(&args.data_dir).map_err(|err| {
        io_error(
            &format!("failed to create {}", args.data_dir.display()),
            err,
        )
    })?;

    let config = AgentConfig {
        link: settings,
        ping_quality: args.ping_quality,
        ..AgentConfig::default()
    };
    let agent = DeviceAgent::start(config, Collaborators::host(&args.data_dir))
        .await
        .map_err(|err| device_error("device agent failed to start", err))?;

    let mut status = agent.status();
    let initial = status.borrow_and_update().clone();
    print_link_status(&initial, format);

    let deadline = async {
        match run_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                print_link_status(&current, format);
            }
        }
    }

    agent.shutdown().await;
    Ok(SUCCESS)
}

/// Settings file (if any) overlaid with command-line flags.
fn resolve_settings(args: &DeviceArgs) -> CliResult<LinkSettings> {
    let mut settings = match &args.settings {
        Some(path) => JsonSettingsStore::new(path)
            .load()
            .map_err(|err| peer_error("failed to load settings", err))?
            .unwrap_or_default(),
        None => LinkSettings::default(),
    };

    if let Some(host) = &args.host {
        settings.host = host.clone();
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if args.legacy {
        settings.use_legacy_port = true;
    }
    if let Some(device_id) = &args.device_id {
        settings.device_id = device_id.clone();
    }
    if let Some(token) = &args.token {
        settings.auth_token = Some(AuthToken::new(token.clone()));
    }
    if args.no_reconnect {
        settings.auto_reconnect = false;
    }
    if args.tls {
        settings.use_tls = true;
    }
    if let Some(ca) = &args.tls_ca {
        settings.tls_ca_file = Some(ca.clone());
    }

    settings
        .validate()
        .map_err(|err| peer_error("invalid settings", err))?;
    Ok(settings)
}
