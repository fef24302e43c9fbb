use bytes::Bytes;
use someip_middleware::{logging, Application, Message, RuntimeConfig, ServiceKey};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

const KEY: ServiceKey = ServiceKey::new(0x1234, 0x5678);
const METHOD_ID: u16 = 0x0421;
const EVENT_ID: u16 = 0x8778;
const EVENTGROUP_ID: u16 = 0x4465;

fn load_config() -> someip_middleware::Result<RuntimeConfig> {
    match std::env::args().nth(1) {
        Some(path) => RuntimeConfig::load(path),
        None => Ok(RuntimeConfig { client_id: 0x1343, ..Default::default() }),
    }
}

// Sends ten ascending bytes and logs the answer off the notifier thread.
fn send_request(app: &Application) {
    let payload: Vec<u8> = (0u8..10).collect();
    match app.request(KEY, METHOD_ID, payload) {
        Ok(pending) => {
            thread::spawn(move || match pending.wait_timeout(Duration::from_secs(2)) {
                Ok(response) => log::info!(
                    "Response (client 0x{:04x}, session 0x{:04x}): {:02x?}",
                    response.client_id(),
                    response.session_id(),
                    response.payload().as_ref()
                ),
                Err(e) => log::warn!("No response: {}", e),
            });
        }
        Err(e) => log::warn!("Request failed: {}", e),
    }
}

fn run() -> someip_middleware::Result<()> {
    let app = Application::new("client", load_config()?);

    let stopper = Arc::clone(&app);
    ctrlc::set_handler(move || {
        log::info!("Shutting down...");
        if let Err(e) = stopper.stop() {
            log::warn!("Stop failed: {}", e);
        }
    })
    .ok();

    let weak: Weak<Application> = Arc::downgrade(&app);
    app.on_availability(KEY, move |key: ServiceKey, available: bool| {
        log::info!("Service {} is {}", key, if available { "available" } else { "NOT available" });
        if let (true, Some(app)) = (available, weak.upgrade()) {
            send_request(&app);
        }
    })?;
    app.register_event_handler(KEY, EVENT_ID, |event: &Message, from: SocketAddr| -> Option<Bytes> {
        log::info!(
            "Event 0x{:04x} from {}: {:02x?}",
            event.method_id(),
            from,
            event.payload().as_ref()
        );
        None
    })?;
    app.request_service(KEY)?;
    app.subscribe(KEY, EVENTGROUP_ID)?;

    app.init()?;
    app.start()
}

fn main() {
    logging::init();
    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
