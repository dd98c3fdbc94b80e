// Operator loop: setup, keyboard signals, sequencing and telemetry
//
// The bus is driven from one blocking task that owns the controller. Keyboard
// input and telemetry run on their own tasks and talk to it over channels, so
// the bus is never touched from two places.

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

use crate::config::{KEY_POLL_INTERVAL, RuntimeConfig};
use crate::messages::{PollReport, Signal};
use crate::sequencer::MotionSequencer;
use crate::servo::{DeviceController, PacketTransport, Protocol2Bus, Register, RegisterMap, SimulatedBus};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Open the configured transport. A port that can't be opened stops us here.
fn open_transport(config: &RuntimeConfig, map: RegisterMap) -> Result<Box<dyn PacketTransport + Send>, BoxError> {
    if config.simulate {
        info!("Using simulated bus with devices {:?}", config.ids);
        return Ok(Box::new(SimulatedBus::new(map, &config.ids).with_step(config.sim_step)));
    }

    info!("Opening servo bus on {} at {} baud", config.port, config.baudrate);
    let bus = Protocol2Bus::open_with_baudrate(&config.port, config.baudrate)?;
    info!("Succeeded to open the port");
    Ok(Box::new(bus))
}

pub async fn run(config: RuntimeConfig) -> Result<(), BoxError> {
    config.validate()?;
    let map = RegisterMap::for_model(config.model);
    let transport = open_transport(&config, map)?;

    let mut ctrl = DeviceController::new(transport, map, config.ids.clone())?;

    let pings = ctrl.ping_all();
    if !pings.is_clean() {
        warn!("{} of {} devices did not answer ping", pings.failures.len(), pings.attempted.len());
    }
    let torque = ctrl.set_torque(true)?;
    if !torque.is_clean() {
        warn!("Torque enable failed on {} devices", torque.failures.len());
    }
    let profile = ctrl.configure_profile(config.profile_acceleration, config.profile_velocity)?;
    if !profile.is_clean() {
        warn!("Profile setup failed on {} devices", profile.failures.len());
    }
    for &id in &config.ids {
        match ctrl.read_register(id, Register::PresentPosition) {
            Ok(position) => info!("[ID:{:03}] Starting at PresPos:{:03}", id, position),
            Err(e) => warn!("Could not read starting position of device {}: {}", id, e),
        }
    }

    let mut sequencer = MotionSequencer::new(config.goal_sets()?, config.threshold)?
        .with_limit(config.poll_limit())
        .with_poll_interval(config.poll_interval());

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let (report_tx, report_rx) = mpsc::unbounded_channel();

    let topic = config.telemetry.then(|| config.telemetry_topic.clone());
    let telemetry = tokio::spawn(async move {
        if let Err(e) = publish_reports(report_rx, topic).await {
            warn!("Telemetry stopped: {}", e);
        }
    });

    let keyboard = match config.auto_cycles {
        Some(cycles) => {
            info!("Running {} cycles without keyboard input", cycles);
            for _ in 0..cycles {
                let _ = signal_tx.send(Signal::Advance);
            }
            let _ = signal_tx.send(Signal::Quit);
            None
        }
        None => {
            enable_raw_mode()?;
            Some(tokio::task::spawn_blocking(move || read_keys(signal_tx)))
        }
    };

    let control = tokio::task::spawn_blocking(move || {
        let result = sequencer.run(&mut ctrl, &mut signal_rx, |report: &PollReport| {
            let _ = report_tx.send(report.clone());
        });
        // Lets the keyboard task notice we're done
        drop(signal_rx);

        match ctrl.shutdown() {
            Ok(report) if !report.is_clean() => {
                warn!("Torque disable failed on {} devices", report.failures.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Shutdown failed: {}", e),
        }
        result
    })
    .await;

    if let Some(keyboard) = keyboard {
        match keyboard.await {
            Ok(Err(e)) => warn!("Keyboard input failed: {}", e),
            Err(e) => warn!("Keyboard task panicked: {}", e),
            Ok(Ok(())) => {}
        }
        disable_raw_mode()?;
    }
    let _ = telemetry.await;

    control??;
    info!("Runtime stopped");
    Ok(())
}

/// Esc, q and Ctrl-C quit; any other key advances to the next goal set
fn read_keys(signals: UnboundedSender<Signal>) -> std::io::Result<()> {
    while !signals.is_closed() {
        if !event::poll(KEY_POLL_INTERVAL)? {
            continue;
        }
        if let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = event::read()?
        {
            if kind != KeyEventKind::Press {
                continue;
            }
            let signal = match code {
                KeyCode::Esc | KeyCode::Char('q') => Signal::Quit,
                KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => Signal::Quit,
                _ => Signal::Advance,
            };
            if signals.send(signal).is_err() {
                break;
            }
        }
    }
    Ok(())
}

/// Log every poll report and optionally publish it as JSON over zenoh
async fn publish_reports(mut reports: UnboundedReceiver<PollReport>, topic: Option<String>) -> Result<(), BoxError> {
    let zenoh = match topic {
        Some(topic) => {
            info!("Opening Zenoh session...");
            let session = zenoh::open(zenoh::Config::default()).await?;
            let publisher = session.declare_publisher(topic.clone()).await?;
            info!("Publishing to: {}", topic);
            Some((session, publisher))
        }
        None => None,
    };

    while let Some(report) = reports.recv().await {
        for sample in &report.samples {
            match sample.present {
                Some(present) => info!("[ID:{:03}] GoalPos:{:03}  PresPos:{:03}", sample.id, sample.goal, present),
                None => info!("[ID:{:03}] GoalPos:{:03}  PresPos:---", sample.id, sample.goal),
            }
        }

        if let Some((_, publisher)) = &zenoh {
            let json = serde_json::to_string(&report)?;
            publisher.put(json).await?;
        }
    }
    Ok(())
}
