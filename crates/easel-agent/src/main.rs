use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use easel_agent::{
    config::{AgentConfig, Credentials},
    context::AgentContext,
    pipeline::{ProvisionJob, launcher_spec_from_document},
    projects::ProjectManager,
    queue::JobOutcome,
    toolchain::{SystemToolchain, Toolchain},
};
use easel_project::LauncherSpec;

#[derive(Parser, Debug)]
#[command(name = "easel-agent", version, about = "Provision and run isolated ComfyUI projects")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a project and wait for provisioning to finish.
    Create {
        #[arg(long)]
        name: String,
        /// Launcher descriptor or bare workflow JSON.
        #[arg(long)]
        descriptor: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the provisioning pipeline against an explicit directory.
    Provision {
        project_path: PathBuf,
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        descriptor: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
        /// Wipe and recreate the directory first (`--create-project-folder false` to reuse it).
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        create_project_folder: bool,
    },
    Start {
        id: String,
    },
    Stop {
        id: String,
    },
    Status {
        id: String,
    },
    List,
    Delete {
        id: String,
    },
    /// Read or change the stored download credentials.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Get,
    /// Only the given values change; an empty string clears one.
    Set {
        #[arg(long)]
        civitai_apikey: Option<String>,
        #[arg(long)]
        huggingface_token: Option<String>,
    },
}

async fn load_descriptor(path: Option<&PathBuf>) -> anyhow::Result<Option<LauncherSpec>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    let doc = serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))?;
    launcher_spec_from_document(doc).map(Some)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let ctx = AgentContext::new(AgentConfig::from_env())?;
    let toolchain: Arc<dyn Toolchain> = Arc::new(SystemToolchain::from_config(&ctx.config));
    let manager = ProjectManager::new(ctx.clone(), toolchain);

    match cli.command {
        Commands::Create {
            name,
            descriptor,
            port,
        } => {
            let spec = load_descriptor(descriptor.as_ref()).await?;
            let created = manager.create(&name, spec, port).await?;
            tracing::info!(project_id = %created.id, job_id = %created.job.id, "waiting for provisioning");
            let outcome = created.job.wait().await;
            print_json(&manager.get(&created.id).await?)?;
            match outcome {
                JobOutcome::Succeeded => {}
                JobOutcome::Failed(msg) => anyhow::bail!("provisioning failed: {msg}"),
                JobOutcome::Cancelled => anyhow::bail!("provisioning cancelled"),
            }
        }
        Commands::Provision {
            project_path,
            id,
            name,
            descriptor,
            port,
            create_project_folder,
        } => {
            let mut job = ProvisionJob::new(project_path, ctx.config.models_dir.clone(), id, name);
            job.launcher_spec = load_descriptor(descriptor.as_ref()).await?;
            job.port = port;
            job.create_project_folder = create_project_folder;
            let outcome = manager.provisioner().provision(job).await?;
            let missing: Vec<&String> = outcome.report.missing_files.iter().collect();
            print_json(&serde_json::json!({ "missing_files": missing }))?;
        }
        Commands::Start { id } => {
            let port = manager.supervisor().start(&id).await?;
            print_json(&serde_json::json!({ "id": id, "port": port }))?;
        }
        Commands::Stop { id } => {
            manager.supervisor().stop(&id).await?;
            print_json(&manager.get(&id).await?)?;
        }
        Commands::Status { id } => print_json(&manager.get(&id).await?)?,
        Commands::List => print_json(&manager.list().await?)?,
        Commands::Delete { id } => {
            manager.delete(&id).await?;
            tracing::info!(project_id = %id, "deleted");
        }
        Commands::Config { action } => match action {
            ConfigAction::Get => print_json(&ctx.credentials())?,
            ConfigAction::Set {
                civitai_apikey,
                huggingface_token,
            } => {
                if civitai_apikey.is_none() && huggingface_token.is_none() {
                    anyhow::bail!("nothing to set: pass --civitai-apikey or --huggingface-token");
                }
                let updated = Credentials::update(
                    &ctx.config.credentials_path,
                    civitai_apikey.as_deref(),
                    huggingface_token.as_deref(),
                )?;
                print_json(&updated)?;
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Commands {
        let mut argv = vec!["easel-agent"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().command
    }

    #[test]
    fn provision_wipes_folder_unless_told_not_to() {
        let base = ["provision", "/p", "--id", "a", "--name", "A"];
        let Commands::Provision {
            create_project_folder,
            ..
        } = parse(&base)
        else {
            panic!("expected provision");
        };
        assert!(create_project_folder);

        let mut keep = base.to_vec();
        keep.extend(["--create-project-folder", "false"]);
        let Commands::Provision {
            create_project_folder,
            ..
        } = parse(&keep)
        else {
            panic!("expected provision");
        };
        assert!(!create_project_folder);
    }

    #[test]
    fn config_set_takes_either_credential() {
        let Commands::Config {
            action:
                ConfigAction::Set {
                    civitai_apikey,
                    huggingface_token,
                },
        } = parse(&["config", "set", "--huggingface-token", "hf"])
        else {
            panic!("expected config set");
        };
        assert_eq!(civitai_apikey, None);
        assert_eq!(huggingface_token.as_deref(), Some("hf"));
        assert!(matches!(
            parse(&["config", "get"]),
            Commands::Config {
                action: ConfigAction::Get
            }
        ));
    }
}
