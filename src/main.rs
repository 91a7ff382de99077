use std::env;
use std::process;

use slog::{error, info, Logger};
use sloggers::{Config as _, LoggerConfig};

use dagon::dagon::async_runtime as rt;
use dagon::dagon::config::Config;
use dagon::dagon::core::{self, Core};
use dagon::dagon::listener;

fn build_logger(level: &str) -> Logger {
    let toml = format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    );
    let config: LoggerConfig = serdeconv::from_toml_str(&toml).expect("logger config");
    config.build_logger().expect("logger build")
}

fn main() {
    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| "dagon.toml".to_string());
    let conf = match Config::load(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("dagon: cannot load {}: {}", path, e);
            process::exit(1);
        }
    };
    let log = build_logger(&conf.logging.level);

    let runtime = match dagon::dagon::init() {
        Ok(rt) => rt,
        Err(e) => {
            error!(log, "Runtime init failed: {}", e);
            process::exit(1);
        }
    };

    info!(log, "dagon starting as {} [{}]", conf.server.name, conf.server.sid);

    runtime.block_on(async move {
        let (tx, rx) = core::event_channel();
        let mut core = Core::new(conf, log, tx.clone());

        if let Some(helper_conf) = core.conf.helper.clone() {
            let log = core.log.clone();
            core.helpers.start(&helper_conf, tx.clone(), &log);
        }
        listener::start_all(&mut core);

        for (idx, block) in core.conf.connect.clone().iter().enumerate() {
            if block.autoconnect && block.port != 0 {
                rt::spawn(core::connect_pump(
                    idx,
                    block.host.clone(),
                    block.port,
                    tx.clone(),
                ));
            }
        }

        rt::spawn(core::tick_pump(tx.clone()));
        rt::spawn(core::signal_pump(tx));

        core::run(core, rx).await;
    });
}
