use std::sync::Arc;

use pay_listener::{
    chain::AdapterRegistry,
    config::Config,
    db::{repositories::models::payment::Currency, Repository},
    endpoints::{
        self,
        check::{CheckPaymentData, CheckPaymentResponse},
        new::{CreatePaymentData, CreatePaymentResponse},
        status::PaymentStatusResponse,
    },
    notifier::WebhookNotifier,
    reconciler::Reconciler,
    scheduler::Scheduler,
    wallet::Wallets,
};
use poem::{listener::TcpListener, middleware::Cors, web::Data, EndpointExt, Route, Server};
use poem_openapi::{param::Path, payload::Json, OpenApi, OpenApiService};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

struct Api;

#[OpenApi]
impl Api {
    #[oai(path = "/new", method = "post")]
    async fn new(
        &self,
        pool: Data<&Repository>,
        wallets: Data<&Arc<Wallets>>,
        data: Json<CreatePaymentData>,
    ) -> CreatePaymentResponse {
        endpoints::new::new(pool.0, &wallets, &data).await
    }

    #[oai(path = "/status/:id", method = "get")]
    async fn status(&self, pool: Data<&Repository>, id: Path<Uuid>) -> PaymentStatusResponse {
        endpoints::status::status(pool.0, &id).await
    }

    #[oai(path = "/check", method = "post")]
    async fn check(
        &self,
        pool: Data<&Repository>,
        adapters: Data<&Arc<AdapterRegistry>>,
        data: Json<CheckPaymentData>,
    ) -> CheckPaymentResponse {
        endpoints::check::check(pool.0, &adapters, &data).await
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install().ok();
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let repository = Repository::connect(&config.database_url).await?;
    debug!("Connected to database");

    let adapters = Arc::new(AdapterRegistry::from_config(&config.chains)?);
    let wallets = Arc::new(Wallets::from_config(&config.wallet)?);
    for currency in Currency::ALL {
        if wallets.supports(currency) && !adapters.supports(currency) {
            warn!("{} payments can be created but will never be detected", currency);
        }
    }
    let notifier = Arc::new(WebhookNotifier::new(
        reqwest::Client::new(),
        config.webhook_timeout,
    ));

    let reconciler = Arc::new(Reconciler::new(
        repository.clone(),
        adapters.clone(),
        notifier,
        config.reconcile,
    ));
    let scheduler = Scheduler::new(reconciler, config.reconcile_interval, config.sweep_interval);

    let api_service = OpenApiService::new(Api, "Pay Listener API", "v0.1.0")
        .server(format!("http://{}", config.bind_address));
    let open_api = api_service.swagger_ui();

    let routes = Route::new()
        .nest("/", api_service)
        .nest("/swagger", open_api)
        .with(Cors::new())
        .data(repository)
        .data(wallets)
        .data(adapters);

    info!("Listening on {}", config.bind_address);
    let server = Server::new(TcpListener::bind(config.bind_address.clone())).run(routes);

    tokio::select! {
        res = server => res?,
        _ = scheduler.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
