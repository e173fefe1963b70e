use anyhow::{bail, Context};
use usb8dev::host::{find_device, Usb8devEvent, Usb8devHost};
use usb8dev_protocol::embedded_can::{Frame, Id};
use usb8dev_protocol::{OpenParams, VersionInfo};

/// 500 kbit/s against the 32 MHz reference: 32 MHz / 4 / (1 + 13 + 2)
const DEFAULT_TIMING: [u32; 4] = [13, 2, 1, 4];

const USAGE: &str = "usage: usb8dev-dump [ts1 ts2 sjw brp [ctrl-mode]]";

fn parse_arg(arg: &str) -> anyhow::Result<u32> {
    let value = match arg.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => arg.parse(),
    };
    value.with_context(|| format!("bad number {arg:?}"))
}

fn open_params() -> anyhow::Result<OpenParams> {
    let args = std::env::args()
        .skip(1)
        .map(|a| parse_arg(&a))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if !args.is_empty() && !(4..=5).contains(&args.len()) {
        bail!(USAGE);
    }
    let get = |i: usize| args.get(i).copied().unwrap_or_else(|| DEFAULT_TIMING.get(i).copied().unwrap_or(0));

    Ok(OpenParams {
        ts1: u8::try_from(get(0)).context("ts1")?,
        ts2: u8::try_from(get(1)).context("ts2")?,
        sjw: u8::try_from(get(2)).context("sjw")?,
        brp: u16::try_from(get(3)).context("brp")?,
        ctrl_mode: get(4),
    })
}

fn print_event(event: &Usb8devEvent) {
    match event {
        Usb8devEvent::Frame { frame, timestamp_ms } => {
            let id = match frame.id() {
                Id::Standard(id) => format!("{:03x}", id.as_raw()),
                Id::Extended(id) => format!("{:08x}", id.as_raw()),
            };
            if frame.is_remote_frame() {
                println!("{timestamp_ms:>10} {id:>8} [{}] remote", frame.dlc());
            } else {
                println!("{timestamp_ms:>10} {id:>8} [{}] {:02x?}", frame.dlc(), frame.data());
            }
        }
        Usb8devEvent::Error { code, counters, timestamp_ms } => {
            println!("{timestamp_ms:>10} error {code:?} rx={} tx={}", counters.rx, counters.tx);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let params = open_params()?;

    let device = find_device().context("adapter not connected")?;
    println!("Device found: {:?}", device);

    let (host, mut poller, mut channel) = Usb8devHost::open_device(device, 64)?;
    let version = host.get_version().await?;
    let (fw_major, fw_minor) = VersionInfo::major_minor(version.firmware);
    let (hw_major, hw_minor) = VersionInfo::major_minor(version.hardware);
    println!("firmware v{fw_major}.{fw_minor} hardware v{hw_major}.{hw_minor}");

    tokio::spawn(async move {
        if let Err(e) = poller.poll(8, false).await {
            log::error!("data endpoint stopped: {e}");
        }
    });

    host.open_bus(&params).await?;
    log::info!("bus open: {params:?}");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("ctrl-c detected, closing bus");
                break;
            }
            event = channel.read() => print_event(&event?),
        }
    }

    host.close_bus().await?;
    Ok(())
}
