use bytes::Bytes;
use someip_middleware::{logging, Application, Message, RuntimeConfig, ServiceKey};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const KEY: ServiceKey = ServiceKey::new(0x1234, 0x5678);
const METHOD_ID: u16 = 0x0421;
const EVENT_ID: u16 = 0x8778;
const EVENTGROUP_ID: u16 = 0x4465;

fn load_config() -> someip_middleware::Result<RuntimeConfig> {
    match std::env::args().nth(1) {
        Some(path) => RuntimeConfig::load(path),
        None => Ok(RuntimeConfig::default()),
    }
}

fn run() -> someip_middleware::Result<()> {
    let app = Application::new("service", load_config()?);

    let stopper = Arc::clone(&app);
    ctrlc::set_handler(move || {
        log::info!("Shutting down...");
        if let Err(e) = stopper.stop() {
            log::warn!("Stop failed: {}", e);
        }
    })
    .ok();

    app.offer_event(KEY, EVENT_ID, [EVENTGROUP_ID])?;
    app.offer_service(KEY, [METHOD_ID])?;
    app.register_handler(KEY, METHOD_ID, |request: &Message, from: SocketAddr| -> Option<Bytes> {
        log::info!(
            "Request from {} (client 0x{:04x}, session 0x{:04x}): {:02x?}",
            from,
            request.client_id(),
            request.session_id(),
            request.payload().as_ref()
        );
        let mut payload = request.payload().to_vec();
        payload.reverse();
        Some(Bytes::from(payload))
    })?;

    app.init()?;
    app.notify_periodically(KEY, EVENT_ID, vec![0x10u8], Duration::from_secs(3))?;
    log::info!("Offering {} (method 0x{:04x}, event 0x{:04x})", KEY, METHOD_ID, EVENT_ID);
    app.start()
}

fn main() {
    logging::init();
    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
