use anyhow::{Context, Result, bail};
use log::{info, warn};
use std::fs;
use std::io::Write;

use rcx_link::download::{Event, download_firmware, download_firmware_fast, download_program};
use rcx_link::image::ProgramImage;
use rcx_link::port::SerialTransport;
use rcx_link::proto::opcode::SystemSound;
#[cfg(feature = "usb")]
use rcx_link::usb::UsbTowerTransport;
use rcx_link::{Brick, LineSpeed, Transceiver, Transport};

use crate::cli::{Cli, Cmd, FirmwareOpts, ProgramOpts, SerialOpts};

type Tower = Brick<Box<dyn Transport>>;

pub fn open(ser: &SerialOpts) -> Result<Tower> {
    #[cfg(feature = "usb")]
    if ser.usb {
        let transport: Box<dyn Transport> = Box::new(
            UsbTowerTransport::connect(ser.line_speed()).context("open USB IR tower")?,
        );
        info!("[usb] tower at {} baud", ser.line_speed().baud());
        return Ok(Brick::new(Transceiver::new(transport, ser.link_config())));
    }

    let settings = ser.settings();
    let transport: Box<dyn Transport> = Box::new(
        SerialTransport::connect(settings.clone())
            .with_context(|| format!("open IR tower on {}", settings.dev))?,
    );
    info!("[port] {} at {} baud", settings.dev, settings.baud);
    Ok(Brick::new(Transceiver::new(transport, ser.link_config())))
}

pub fn run(cli: Cli) -> Result<()> {
    if let Cmd::Firmware(opts) = &cli.cmd
        && opts.fast_stub.is_some()
        && cli.ser.fast
    {
        bail!("--fast-stub starts at the standard speed; drop --fast");
    }

    let mut brick = open(&cli.ser)?;
    match cli.cmd {
        Cmd::Ping => {
            brick.ping().context("ping")?;
            println!("brick is alive");
        }
        Cmd::Info => info_cmd(&mut brick)?,
        Cmd::Sound { sound } => brick.play_system_sound(sound).context("play sound")?,
        Cmd::Tone { freq, duration } => brick.play_tone(freq, duration).context("play tone")?,
        Cmd::RemoteSound => brick.remote_sound().context("remote sound")?,
        Cmd::Program(opts) => program(&mut brick, &opts)?,
        Cmd::Firmware(opts) => firmware(&mut brick, &opts)?,
    }
    Ok(())
}

fn info_cmd(brick: &mut Tower) -> Result<()> {
    let v = brick.get_versions().context("read versions")?;
    println!("ROM      {}", v.rom);
    if v.has_firmware() {
        println!("firmware {}", v.firmware);
    } else {
        println!("firmware none (ROM only)");
    }
    let b = brick.get_battery_level().context("read battery level")?;
    println!("battery  {} mV (~{:.0}%)", b.millivolts, b.percent());
    Ok(())
}

fn program(brick: &mut Tower, opts: &ProgramOpts) -> Result<()> {
    let bytes = fs::read(&opts.file).with_context(|| format!("read {}", opts.file.display()))?;
    let image = ProgramImage::parse(&bytes)
        .with_context(|| format!("parse {}", opts.file.display()))?;
    info!(
        "[dl] {}: {} chunks, {} symbols",
        opts.file.display(),
        image.chunks.len(),
        image.symbol_count
    );

    let summary = download_program(brick, opts.slot, &image, &opts.xfer.options(), &mut progress)
        .context("program download")?;
    println!(
        "program {} loaded: {} bytes in {:.1}s",
        opts.slot + 1,
        summary.bytes,
        summary.elapsed.as_secs_f64()
    );

    if let Err(e) = brick.play_system_sound(SystemSound::FastSweepUp) {
        warn!("[cmd] completion sound: {}", e);
    }
    Ok(())
}

fn firmware(brick: &mut Tower, opts: &FirmwareOpts) -> Result<()> {
    let image = fs::read(&opts.file).with_context(|| format!("read {}", opts.file.display()))?;
    let xfer = opts.xfer.options();
    let summary = match &opts.fast_stub {
        Some(path) => {
            let stub = fs::read(path).with_context(|| format!("read {}", path.display()))?;
            let summary = download_firmware_fast(brick, &stub, &image, &xfer, &mut progress)
                .context("firmware download through the fast stub")?;
            // the new firmware listens at the standard speed
            brick
                .link_mut()
                .switch_speed(LineSpeed::Standard)
                .context("return to standard speed")?;
            summary
        }
        None => download_firmware(brick, &image, &xfer, &mut progress)
            .context("firmware download")?,
    };
    println!(
        "firmware loaded: {} bytes in {:.1}s ({} retries)",
        summary.bytes,
        summary.elapsed.as_secs_f64(),
        summary.retries
    );

    match brick.get_versions() {
        Ok(v) if v.has_firmware() => println!("firmware {}", v.firmware),
        Ok(_) => warn!("[cmd] brick still reports no firmware"),
        Err(e) => warn!("[cmd] version check after download: {}", e),
    }
    Ok(())
}

fn progress(event: Event) {
    if let Event::Block(stage, p) = event {
        eprint!(
            "\r{}: {:5.1}% ({}/{} blocks, {} retries)",
            stage,
            p.percent(),
            p.done,
            p.total,
            p.retries
        );
        if p.done == p.total {
            eprintln!();
        }
        let _ = std::io::stderr().flush();
    }
}
