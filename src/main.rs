use std::env;
use std::process::ExitCode;

use uuid::Uuid;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "\
usage: usbipd <command> [options]

commands:
  list                      print present devices and persisted shares
  bind -b <busid> | -a      share a device (or all present devices)
  unbind -b <busid> | -g <guid> | -a
                            stop sharing
  server [key=value ...]    run the USB/IP server attached to the console
                            (keys: address, port)
  license                   print license information
  -v, --version             print the version
  -h, --help                print this help
";

const LICENSE: &str = "\
usbipd is licensed under either of

  * Apache License, Version 2.0
  * MIT license

at your option.
";

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let argv: Vec<&str> = args.iter().map(String::as_str).collect();
    match argv.split_first() {
        Some((&"list", _)) => commands::list(),
        Some((&"bind", rest)) => match parse_selector(rest, false) {
            Ok(sel) => commands::bind(sel),
            Err(e) => usage_error(&e),
        },
        Some((&"unbind", rest)) => match parse_selector(rest, true) {
            Ok(sel) => commands::unbind(sel),
            Err(e) => usage_error(&e),
        },
        Some((&"server", rest)) => commands::server(rest),
        Some((&"license", _)) => {
            print!("{LICENSE}");
            ExitCode::SUCCESS
        }
        Some((&"-v", _)) | Some((&"--version", _)) => {
            println!("usbipd {VERSION}");
            ExitCode::SUCCESS
        }
        Some((&"-h", _)) | Some((&"--help", _)) | None => {
            print!("{USAGE}");
            ExitCode::SUCCESS
        }
        Some((other, _)) => usage_error(&format!("unknown command {other:?}")),
    }
}

fn usage_error(message: &str) -> ExitCode {
    eprintln!("usbipd: {message}");
    eprint!("{USAGE}");
    ExitCode::from(2)
}

/// Device selector for bind/unbind.
enum Selector {
    BusId(String),
    Guid(Uuid),
    All,
}

fn parse_selector(args: &[&str], allow_guid: bool) -> Result<Selector, String> {
    match args {
        ["-b", bus_id] => Ok(Selector::BusId((*bus_id).to_owned())),
        ["-g", guid] if allow_guid => Uuid::parse_str(guid)
            .map(Selector::Guid)
            .map_err(|_| format!("{guid:?} is not a GUID")),
        ["-a"] => Ok(Selector::All),
        _ => Err("expected -b <busid>, -g <guid>, or -a".to_owned()),
    }
}

#[cfg(target_os = "windows")]
mod commands {
    use super::{Selector, VERSION};
    use std::process::ExitCode;
    use std::sync::Arc;

    use log::{error, info};
    use tokio::{net::TcpListener, sync::watch};
    use usbipd::{
        Config, DeviceHost, ExportedDevice, RegistryShareStore, Server, ShareRegistry, WindowsHost,
    };

    fn open_host() -> Result<WindowsHost, ExitCode> {
        WindowsHost::new().map_err(|e| {
            eprintln!("usbipd: {e}");
            ExitCode::FAILURE
        })
    }

    fn open_registry() -> Result<ShareRegistry, ExitCode> {
        ShareRegistry::open(Arc::new(RegistryShareStore::new())).map_err(|e| {
            eprintln!("usbipd: loading shares failed: {e}");
            ExitCode::FAILURE
        })
    }

    fn friendly_name(dev: &ExportedDevice) -> String {
        format!("USB device {:04x}:{:04x}", dev.vendor_id, dev.product_id)
    }

    pub fn list() -> ExitCode {
        let (host, registry) = match (open_host(), open_registry()) {
            (Ok(h), Ok(r)) => (h, r),
            (Err(e), _) | (_, Err(e)) => return e,
        };
        let devices = match host.enumerate() {
            Ok(devices) => devices,
            Err(e) => {
                eprintln!("usbipd: {e}");
                return ExitCode::FAILURE;
            }
        };

        println!("{:<8}{:<12}{}", "BUSID", "VID:PID", "STATE");
        for dev in &devices {
            let state = match registry
                .all_shared()
                .iter()
                .find(|r| r.bus_id == dev.bus_id)
            {
                Some(rec) if rec.attached_to.is_some() => "attached",
                Some(_) => "shared",
                None => "not shared",
            };
            println!(
                "{:<8}{:04x}:{:04x}   {}",
                dev.bus_id, dev.vendor_id, dev.product_id, state
            );
        }

        let absent: Vec<_> = registry
            .all_shared()
            .into_iter()
            .filter(|rec| !devices.iter().any(|d| d.bus_id == rec.bus_id))
            .collect();
        if !absent.is_empty() {
            println!();
            println!("persisted shares with no device present:");
            for rec in absent {
                println!("{:<8}{}", rec.bus_id, rec.guid);
            }
        }
        ExitCode::SUCCESS
    }

    pub fn bind(selector: Selector) -> ExitCode {
        let (host, registry) = match (open_host(), open_registry()) {
            (Ok(h), Ok(r)) => (h, r),
            (Err(e), _) | (_, Err(e)) => return e,
        };
        let devices = match host.enumerate() {
            Ok(devices) => devices,
            Err(e) => {
                eprintln!("usbipd: {e}");
                return ExitCode::FAILURE;
            }
        };
        let selected: Vec<&ExportedDevice> = match &selector {
            Selector::BusId(bus_id) => {
                let Some(dev) = devices.iter().find(|d| &d.bus_id == bus_id) else {
                    eprintln!("usbipd: bus id {bus_id} not found");
                    return ExitCode::FAILURE;
                };
                vec![dev]
            }
            Selector::All => devices.iter().collect(),
            Selector::Guid(_) => unreachable!("bind has no -g selector"),
        };
        for dev in selected {
            match registry.share(&dev.bus_id, &friendly_name(dev)) {
                Ok(guid) => println!("{}: shared as {guid}", dev.bus_id),
                Err(e) => {
                    eprintln!("usbipd: sharing {} failed: {e}", dev.bus_id);
                    return ExitCode::FAILURE;
                }
            }
        }
        ExitCode::SUCCESS
    }

    pub fn unbind(selector: Selector) -> ExitCode {
        let registry = match open_registry() {
            Ok(r) => r,
            Err(e) => return e,
        };
        let result = match selector {
            Selector::BusId(bus_id) => match registry.unshare(&bus_id) {
                Ok(true) => Ok(()),
                Ok(false) => {
                    eprintln!("usbipd: bus id {bus_id} is not shared");
                    return ExitCode::FAILURE;
                }
                Err(e) => Err(e),
            },
            Selector::Guid(guid) => match registry.unshare_guid(&guid) {
                Ok(true) => Ok(()),
                Ok(false) => {
                    eprintln!("usbipd: no share with GUID {guid}");
                    return ExitCode::FAILURE;
                }
                Err(e) => Err(e),
            },
            Selector::All => registry.unshare_all(),
        };
        match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("usbipd: {e}");
                ExitCode::FAILURE
            }
        }
    }

    pub fn server(overrides: &[&str]) -> ExitCode {
        let mut config = Config::default();
        if let Err(e) = config.apply_overrides(overrides.iter().copied()) {
            eprintln!("usbipd: {e}");
            return ExitCode::from(2);
        }

        let runtime = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                eprintln!("usbipd: starting runtime failed: {e}");
                return ExitCode::FAILURE;
            }
        };
        let result: Result<(), String> = runtime.block_on(async {
            info!("usbipd {VERSION} starting");
            let host = WindowsHost::new().map_err(|e| e.to_string())?;
            let registry = ShareRegistry::open(Arc::new(RegistryShareStore::new()))
                .map_err(|e| e.to_string())?;
            let server = Server::new(host, registry).map_err(|e| e.to_string())?;
            let listener = TcpListener::bind(config.socket_addr())
                .await
                .map_err(|e| format!("binding {} failed: {e}", config.socket_addr()))?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, shutting down");
                    let _ = shutdown_tx.send(true);
                }
            });
            server
                .run(listener, shutdown_rx)
                .await
                .map_err(|e| e.to_string())
        });
        match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e}");
                eprintln!("usbipd: {e}");
                ExitCode::FAILURE
            }
        }
    }
}

#[cfg(not(target_os = "windows"))]
mod commands {
    use super::Selector;
    use std::process::ExitCode;

    fn unsupported() -> ExitCode {
        eprintln!(
            "usbipd: device capture requires the Windows capture driver; \
             this platform is not supported"
        );
        ExitCode::FAILURE
    }

    pub fn list() -> ExitCode {
        unsupported()
    }

    pub fn bind(_selector: Selector) -> ExitCode {
        unsupported()
    }

    pub fn unbind(_selector: Selector) -> ExitCode {
        unsupported()
    }

    pub fn server(_overrides: &[&str]) -> ExitCode {
        unsupported()
    }
}
