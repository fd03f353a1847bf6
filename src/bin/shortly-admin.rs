use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;

use shortly::auth::AuthService;
use shortly::billing::Limiter;
use shortly::config::{Config, DEFAULT_CONFIG_PATH};
use shortly::kv::Kv;
use shortly::models::{BillingOption, Utm};
use shortly::storage::{self, Storage};

#[derive(Parser)]
#[command(name = "shortly-admin")]
#[command(about = "shortly operator CLI", long_about = None)]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage accounts
    #[command(subcommand)]
    Account(AccountCommand),
    /// Manage billing plans
    #[command(subcommand)]
    Plan(PlanCommand),
    /// Billing limiter maintenance
    #[command(subcommand)]
    Billing(BillingCommand),
    /// Manage campaigns
    #[command(subcommand)]
    Campaign(CampaignCommand),
    /// Tag links
    #[command(subcommand)]
    Tag(TagCommand),
    /// Role permissions
    #[command(subcommand)]
    Permission(PermissionCommand),
    /// Access tokens
    #[command(subcommand)]
    Token(TokenCommand),
}

#[derive(Subcommand)]
enum AccountCommand {
    Create { name: String },
}

#[derive(Subcommand)]
enum PlanCommand {
    Create {
        name: String,
        #[arg(long, default_value_t = 0)]
        price: i64,
        /// Billing option as name=value, repeatable
        #[arg(long = "option", value_parser = parse_option)]
        options: Vec<BillingOption>,
    },
    /// Activate a plan for an account and load its options
    Assign {
        account_id: i64,
        plan: String,
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[derive(Subcommand)]
enum BillingCommand {
    /// Rebuild every account's options from its active plan
    Load,
}

#[derive(Subcommand)]
enum CampaignCommand {
    Create {
        account_id: i64,
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Attach {
        account_id: i64,
        campaign_id: i64,
        short_code: String,
        #[command(flatten)]
        utm: UtmArgs,
    },
}

#[derive(Args)]
struct UtmArgs {
    #[arg(long)]
    utm_source: Option<String>,
    #[arg(long)]
    utm_medium: Option<String>,
    #[arg(long)]
    utm_term: Option<String>,
    #[arg(long)]
    utm_content: Option<String>,
}

#[derive(Subcommand)]
enum TagCommand {
    Add {
        account_id: i64,
        short_code: String,
        tag: String,
    },
}

#[derive(Subcommand)]
enum PermissionCommand {
    Grant { role_id: i64, permission: String },
}

#[derive(Subcommand)]
enum TokenCommand {
    Issue {
        account_id: i64,
        #[arg(long, default_value_t = 0)]
        user_id: i64,
        #[arg(long, default_value_t = 0)]
        role_id: i64,
        #[arg(long)]
        staff: bool,
    },
}

fn parse_option(raw: &str) -> Result<BillingOption> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("expected name=value, got {raw:?}");
    };
    let option = BillingOption::new(name.trim(), value.trim());
    option.int_value()?;
    Ok(option)
}

fn open_limiter(config: &Config, storage: &Arc<dyn Storage>) -> Result<Limiter> {
    let kv = Kv::open(&config.kv.path)?;
    Ok(Limiter::new(kv, Arc::clone(storage), &config.billing.default_plan))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let storage = storage::connect(&config.database).await?;

    match cli.command {
        Commands::Account(AccountCommand::Create { name }) => {
            let id = storage.create_account(&name).await?;
            println!("✓ Created account '{}' with id {}", name, id);
        }
        Commands::Plan(PlanCommand::Create {
            name,
            price,
            options,
        }) => {
            let id = storage.create_plan(&name, price, &options).await?;
            println!("✓ Created plan '{}' with id {} ({} options)", name, id, options.len());
        }
        Commands::Plan(PlanCommand::Assign {
            account_id,
            plan,
            days,
        }) => {
            let found = storage
                .find_plan(&plan)
                .await?
                .with_context(|| format!("no plan named '{plan}'"))?;
            let now = chrono::Utc::now().timestamp();
            storage
                .apply_plan(account_id, found.id, now, now + days * 86_400)
                .await?;

            let limiter = open_limiter(&config, &storage)?;
            let _guard = limiter.lock(account_id).await;
            let links = storage.count_links(account_id).await?;
            let options = shortly::billing::plan_to_account_options(&found.options, links)?;
            limiter.set_plan_options(account_id, options).await?;
            println!("✓ Account {} is on plan '{}' for {} days", account_id, plan, days);
        }
        Commands::Billing(BillingCommand::Load) => {
            let loaded = open_limiter(&config, &storage)?.load_all().await?;
            println!("✓ Loaded billing options for {} accounts", loaded);
        }
        Commands::Campaign(CampaignCommand::Create {
            account_id,
            name,
            description,
        }) => {
            let campaign = storage
                .create_campaign(account_id, &name, description.as_deref())
                .await?;
            println!("✓ Created campaign '{}' with id {}", campaign.name, campaign.id);
        }
        Commands::Campaign(CampaignCommand::Attach {
            account_id,
            campaign_id,
            short_code,
            utm,
        }) => {
            let utm = Utm {
                source: utm.utm_source,
                medium: utm.utm_medium,
                term: utm.utm_term,
                content: utm.utm_content,
            };
            storage
                .attach_to_campaign(account_id, campaign_id, &short_code, &utm)
                .await?;
            println!("✓ Attached '{}' to campaign {}", short_code, campaign_id);
        }
        Commands::Tag(TagCommand::Add {
            account_id,
            short_code,
            tag,
        }) => {
            storage.add_tag(account_id, &short_code, &tag).await?;
            println!("✓ Tagged '{}' with '{}'", short_code, tag);
        }
        Commands::Permission(PermissionCommand::Grant {
            role_id,
            permission,
        }) => {
            storage.grant_permission(role_id, &permission).await?;
            println!("✓ Granted '{}' to role {}", permission, role_id);
        }
        Commands::Token(TokenCommand::Issue {
            account_id,
            user_id,
            role_id,
            staff,
        }) => {
            let auth = AuthService::new(&config.auth, Arc::clone(&storage));
            println!("{}", auth.issue(account_id, user_id, role_id, staff)?);
        }
    }

    storage.close().await;
    Ok(())
}
