pub mod utils;

use clap::{Parser, Subcommand};
use serde_json::json;
use uuid::Uuid;

use crate::api::AppState;
use crate::config::AppConfig;
use crate::database::models::PoolOptions;
use crate::services::tenant_service::{CreateTenantRequest, DatabaseTarget};
use crate::services::user_bootstrap::AdminUserRequest;
use utils::*;

#[derive(Parser)]
#[command(name = "tenantctl")]
#[command(about = "Tenant provisioning and registry administration")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Provision a new tenant database")]
    Create {
        #[arg(help = "Tenant name")]
        name: String,

        #[arg(long, default_value = "localhost", help = "Tenant database host")]
        host: String,

        #[arg(long, default_value_t = 5432)]
        port: u16,

        #[arg(long, help = "Tenant database user")]
        user: String,

        #[arg(long, env = "TENANT_DB_PASS", hide_env_values = true)]
        password: String,

        #[arg(long, help = "Maximum pool connections for this tenant")]
        pool_max: Option<u32>,

        #[arg(long, requires = "admin_password", help = "Create an admin user with this email")]
        admin_email: Option<String>,

        #[arg(long, env = "TENANT_ADMIN_PASS", hide_env_values = true)]
        admin_password: Option<String>,
    },

    #[command(about = "List active tenants")]
    List,

    #[command(about = "Show tenant details")]
    Show {
        #[arg(help = "Tenant ID")]
        id: Uuid,
    },

    #[command(about = "Deactivate a tenant")]
    Deactivate {
        #[arg(help = "Tenant ID")]
        id: Uuid,
    },

    #[command(about = "Apply pending migrations to a tenant database")]
    Migrate {
        #[arg(help = "Tenant ID")]
        id: Uuid,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_cli(cli: &Cli) -> Self {
        if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

pub async fn run(cli: Cli, config: &AppConfig) -> anyhow::Result<()> {
    let output_format = OutputFormat::from_cli(&cli);
    let state = AppState::from_config(config).await?;

    let result = execute(cli.command, &state, output_format).await;
    state.router.close_all().await;

    if let Err(e) = &result {
        output_error(&output_format, &e.to_string())?;
    }
    result
}

async fn execute(command: Commands, state: &AppState, output_format: OutputFormat) -> anyhow::Result<()> {
    match command {
        Commands::Create {
            name,
            host,
            port,
            user,
            password,
            pool_max,
            admin_email,
            admin_password,
        } => {
            let admin_user = match (admin_email, admin_password) {
                (Some(email), Some(password)) => Some(AdminUserRequest {
                    email,
                    password,
                    first_name: None,
                    last_name: None,
                }),
                _ => None,
            };
            let request = CreateTenantRequest {
                name,
                database: DatabaseTarget {
                    host,
                    port,
                    user,
                    password,
                },
                pool_options: pool_max.map(|max| PoolOptions {
                    max: Some(max),
                    ..PoolOptions::default()
                }),
                admin_user,
            };

            let created = state.tenants.create_tenant(request).await?;
            output_success(
                &output_format,
                &format!("Tenant '{}' provisioned as {}", created.name, created.database),
                Some(json!({ "tenant": created })),
            )
        }
        Commands::List => {
            let tenants = state.tenants.list_tenants().await?;
            if tenants.is_empty() {
                return output_empty_collection(&output_format, "tenants", "No active tenants");
            }

            match output_format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&json!({ "tenants": tenants }))?);
                }
                OutputFormat::Text => {
                    println!("{:<38} {:<20} {:<42} {}", "ID", "NAME", "DATABASE", "CREATED");
                    println!("{}", "-".repeat(120));

                    for tenant in &tenants {
                        println!(
                            "{:<38} {:<20} {:<42} {}",
                            tenant.id,
                            tenant.name,
                            tenant.database,
                            tenant.created_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Show { id } => {
            let tenant = state.tenants.get_tenant(id).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tenant)?),
                OutputFormat::Text => {
                    println!("ID:       {}", tenant.id);
                    println!("Name:     {}", tenant.name);
                    println!("Database: {} on {}:{}", tenant.database, tenant.host, tenant.port);
                    println!("Active:   {}", tenant.is_active);
                    println!("Created:  {}", tenant.created_at.format("%Y-%m-%d %H:%M"));
                }
            }
            Ok(())
        }
        Commands::Deactivate { id } => {
            state.tenants.deactivate_tenant(id).await?;
            output_success(&output_format, &format!("Tenant {} deactivated", id), None)
        }
        Commands::Migrate { id } => {
            let applied = state.tenants.migrate_tenant(id).await?;
            let message = if applied.is_empty() {
                format!("Tenant {} is up to date", id)
            } else {
                format!("Applied {} migration(s) to tenant {}", applied.len(), id)
            };
            output_success(&output_format, &message, Some(json!({ "applied": applied })))
        }
    }
}
