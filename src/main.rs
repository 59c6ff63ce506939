use appkeeper::cli::{Cli, Commands};
use appkeeper::commands::{self, daemon, manage, params_from_pairs, query};
use appkeeper::engine::registry::{ChangePortRequest, NewInstall, PageRequest, SearchFilter};
use clap::{CommandFactory, Parser};
use clap_complete::aot::generate;

#[tokio::main]
async fn main() {
    // Logs go to stderr so `--format json` output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let file = cli.global.config_file.as_deref();
    let format = cli.global.format;
    let actor = cli.global.actor.as_str();

    let result = match cli.command {
        Commands::List => query::run_list(file, format).await,
        Commands::Search {
            name,
            app_key,
            status,
            has_update,
            page,
            page_size,
            all,
        } => {
            let filter = SearchFilter {
                name,
                app_key,
                status,
                has_update,
            };
            let page = PageRequest { page, page_size };
            query::run_search(file, filter, page, all, format).await
        }
        Commands::Show { id } => query::run_show(file, id, format).await,
        Commands::Check { app_key, name } => query::run_check(file, &app_key, &name, format).await,
        Commands::Port { app_key, name } => query::run_port(file, &app_key, &name, format).await,
        Commands::Conn { app_key, name } => query::run_conn(file, &app_key, &name, format).await,
        Commands::DeleteCheck { id } => query::run_delete_check(file, id, format).await,
        Commands::Sync { force } => manage::run_sync(file, force, format).await,
        Commands::Operate {
            id,
            action,
            version,
        } => manage::run_operate(file, actor, id, action, version, format).await,
        Commands::Services { app_key, template } => {
            query::run_services(file, &app_key, template, format).await
        }
        Commands::Versions { id, all } => query::run_versions(file, id, all, format).await,
        Commands::ChangePort {
            app_key,
            name,
            port,
            service,
        } => {
            let req = ChangePortRequest {
                app_key,
                name,
                service,
                port,
            };
            manage::run_change_port(file, actor, req).await
        }
        Commands::DefaultConfig { app_key, name } => {
            query::run_default_config(file, &app_key, &name, format).await
        }
        Commands::Params { id } => query::run_params(file, id, format).await,
        Commands::SetParams { id, values } => {
            manage::run_set_params(file, actor, id, values, format).await
        }
        Commands::IgnoreUpgrade { id, version } => {
            manage::run_ignore_upgrade(file, actor, id, &version).await
        }
        Commands::Delete { id, force } => manage::run_delete(file, actor, id, force).await,
        Commands::Register {
            app_key,
            name,
            version,
            values,
        } => {
            let new = NewInstall {
                app_key,
                name,
                version,
                params: params_from_pairs(values),
            };
            manage::run_register(file, actor, new, format).await
        }
        Commands::Complete { id, failed } => manage::run_complete(file, actor, id, failed).await,
        Commands::Bind {
            id,
            kind,
            resource_id,
            name,
        } => manage::run_bind(file, actor, id, &kind, resource_id, name).await,
        Commands::Unbind { kind, resource_id } => {
            manage::run_unbind(file, actor, &kind, resource_id).await
        }
        Commands::Daemon => daemon::run(file).await,
        Commands::Validate => commands::validate::run(file),
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "appkeeper", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
