use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use wsrelay::prelude::*;

/// wsrelay demo server
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Listen host
    #[arg(long, env = "WSRELAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Listen port
    #[arg(long, env = "WSRELAY_PORT", default_value_t = 8085)]
    port: u16,

    /// Broker host
    #[arg(long, env = "WSRELAY_REDIS_HOST", default_value = "127.0.0.1")]
    redis_host: String,

    /// Broker port
    #[arg(long, env = "WSRELAY_REDIS_PORT", default_value_t = 6379)]
    redis_port: u16,

    /// Seconds of silence before a client is pinged
    #[arg(long, env = "WSRELAY_PING_TIMEOUT", default_value_t = 10)]
    ping_timeout: u64,

    /// Run single-node, without a broker
    #[arg(long, env = "WSRELAY_NO_BROKER")]
    no_broker: bool,
}

impl Args {
    fn config(&self) -> ServerConfig {
        let config = ServerConfig::default()
            .with_host(self.host.clone())
            .with_port(self.port)
            .with_ping_timeout(Duration::from_secs(self.ping_timeout));

        if self.no_broker {
            config.without_broker()
        } else {
            config.with_broker(BrokerConfig::new(self.redis_host.clone(), self.redis_port))
        }
    }
}

#[derive(Debug, Deserialize)]
struct Publish {
    channel: String,
    message: serde_json::Value,
}

async fn echo(Payload(fields): Payload) -> JsonReply<serde_json::Value> {
    JsonReply(serde_json::Value::Object(fields))
}

async fn publish(Json(body): Json<Publish>, state: State<Messenger>) -> Result<&'static str> {
    let State(messenger) = state;
    let channel = messenger
        .channel(&body.channel)
        .ok_or_else(|| Error::handler(format!("unknown channel [{}]", body.channel)))?;

    channel.publish(&body.message).await?;
    Ok("published")
}

async fn stats(State(messenger): State<Messenger>) -> Result<JsonReply<serde_json::Value>> {
    let count = messenger.online_count();
    Ok(JsonReply(serde_json::json!({
        "num_clients": count.num_clients,
        "num_online": count.num_online,
        "channels": messenger.channel_names(),
        "broker": messenger.has_broker(),
    })))
}

async fn whoami(caller: Caller) -> Result<JsonReply<Caller>> {
    Ok(JsonReply(caller))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let router = HandlerRouter::new()
        .route("echo", handler(echo))
        .route("publish", handler(publish))
        .route("stats", handler(stats))
        .route("whoami", handler(whoami));

    tracing::info!(host = %args.host, port = args.port, broker = !args.no_broker, "starting relay");
    let runtime = Runtime::bind(args.config(), Arc::new(router)).await?;
    runtime.run().await
}
