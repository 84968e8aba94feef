use std::{env, io};

use log::info;
use tokio::signal;

use server::{controller::Controller, net::Acceptor};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "10789";
const DEFAULT_TOKEN: &str = "GRAVITY";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let addr = format!(
        "{}:{}",
        env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
        env::var("PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string()),
    );
    let token = env::var("STUDIO_TOKEN").unwrap_or_else(|_| DEFAULT_TOKEN.to_string());

    let controller = Controller::new(&token);
    controller.spawn_sessions();

    let acceptor = Acceptor::bind(&addr, controller).await?;

    tokio::select! {
        ret = acceptor.run() => {
            ret?;
        }
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}
