mod console;

use std::fs::File;
use std::io::BufRead;
use std::time::{Duration, Instant};

use intonal_core::config::Config;
use intonal_core::engine::{EngineEvent, EngineHandle, Orchestrator, OutputTarget, VoiceSink};
use intonal_core::midi::{self, list_output_ports, MidiInputManager, MidiSink, MidirSink, NullSink};
use intonal_core::protocol::preference::BackendPreference;
use intonal_core::protocol::BackendKind;
use intonal_core::score_link::ScoreLink;
use intonal_types::tuning::tuned_freq;

use console::Command;

fn init_logging(verbose: bool) {
    use simplelog::*;

    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    let log_path = intonal_core::config::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("intonal.log");

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = match File::create(&log_path).or_else(|_| File::create("/tmp/intonal.log")) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("logging disabled: {}", e);
            return;
        }
    };

    if let Err(e) = WriteLogger::init(log_level, Config::default(), log_file) {
        eprintln!("logging disabled: {}", e);
        return;
    }

    log::info!("intonal starting (log level: {:?})", log_level);
}

/// Value following `flag`, if present.
fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1).cloned())
}

/// Built-in synth stand-in: prints what it would play.
struct PrintVoices {
    reference_a4: f64,
}

impl VoiceSink for PrintVoices {
    fn note_on(&mut self, pitch: u8, velocity: u8, cents: f64) {
        println!(
            "  on  {:>3} vel {:>3} {:+7.2}c {:9.3} Hz",
            pitch,
            velocity,
            cents,
            tuned_freq(pitch, cents, self.reference_a4)
        );
    }

    fn note_off(&mut self, pitch: u8) {
        println!("  off {:>3}", pitch);
    }
}

fn list_ports() {
    let mut inputs = MidiInputManager::new();
    inputs.refresh_ports();
    println!("MIDI inputs:");
    for port in inputs.list_ports() {
        println!("  {}: {}", port.index, port.name);
    }
    println!("MIDI outputs:");
    for port in list_output_ports() {
        println!("  {}: {}", port.index, port.name);
    }
}

fn open_output(query: Option<&str>) -> Box<dyn MidiSink> {
    let ports = list_output_ports();
    let index = match query {
        Some(q) => midi::find_port(&ports, q),
        None => ports.first().map(|p| p.index),
    };
    let Some(index) = index else {
        eprintln!("no MIDI output found, tuned notes go nowhere");
        return Box::new(NullSink);
    };
    match MidirSink::connect(index) {
        Ok(sink) => {
            println!("output: {}", sink.port_name());
            Box::new(sink)
        }
        Err(e) => {
            eprintln!("could not open MIDI output: {}", e);
            Box::new(NullSink)
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    init_logging(verbose);

    if args.iter().any(|a| a == "--list") {
        list_ports();
        return;
    }

    let config = Config::load();
    let settings = config.engine_settings();
    let reference_a4 = settings.reference_a4;
    let internal = settings.output_target == OutputTarget::Internal;

    let out: Box<dyn MidiSink> = if internal {
        Box::new(NullSink)
    } else {
        open_output(flag_value(&args, "--out").as_deref())
    };
    let mut orchestrator = Orchestrator::new(settings, out);
    orchestrator.set_sysex_permission(config.sysex_permission());
    if internal {
        orchestrator = orchestrator.with_voices(Box::new(PrintVoices { reference_a4 }));
    }

    let mut preference = BackendPreference::load();
    if let Some(name) = flag_value(&args, "--backend") {
        match BackendKind::parse(&name) {
            Some(kind) => preference.force = Some(kind),
            None => eprintln!("unknown backend {:?}, negotiating", name),
        }
    }
    if let Some(kind) = preference.force {
        if !orchestrator.set_backend_override(Some(kind), Instant::now()) {
            eprintln!("{} can't be used live, negotiating", kind);
        }
    }

    let engine = EngineHandle::spawn(orchestrator);

    let mut inputs = MidiInputManager::new();
    inputs.refresh_ports();
    let input_index = match flag_value(&args, "--in") {
        Some(q) => midi::find_port(inputs.list_ports(), &q),
        None => inputs.list_ports().first().map(|p| p.index),
    };
    match input_index {
        Some(index) => {
            let events = engine.events();
            let connected = inputs.connect(index, move |event| {
                let _ = events.send(EngineEvent::Midi(event));
            });
            match connected {
                Ok(()) => println!("input: {}", inputs.connected_port_name().unwrap_or("?")),
                Err(e) => eprintln!("could not open MIDI input: {}", e),
            }
        }
        None => eprintln!("no MIDI input found"),
    }

    let score_link = flag_value(&args, "--score").and_then(|addr| {
        match ScoreLink::connect(&addr, engine.events()) {
            Ok(link) => {
                println!("score follower: {}", addr);
                engine.set_score_tap(Some(link.outbound()));
                Some(link)
            }
            Err(e) => {
                eprintln!("could not reach score follower at {}: {}", addr, e);
                None
            }
        }
    });

    engine.start();
    println!("running; type 'help' for commands");
    run_console(&engine, &mut preference);

    if let Err(e) = engine.stop() {
        log::warn!("stop: {}", e);
    }
    inputs.disconnect();
    if let Some(link) = score_link {
        link.close();
    }
}

fn run_console(engine: &EngineHandle, preference: &mut BackendPreference) {
    let (line_tx, line_rx) = crossbeam_channel::unbounded::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        match line_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => match console::parse(&line) {
                Ok(Some(Command::Quit)) => return,
                Ok(Some(cmd)) => apply(engine, preference, cmd),
                Ok(None) => {}
                Err(e) => println!("{}", e),
            },
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }

        for feedback in engine.drain_feedback() {
            if let Some(text) = console::describe(&feedback, verbose_stats()) {
                println!("{}", text);
            }
        }
    }
}

fn verbose_stats() -> bool {
    log::log_enabled!(log::Level::Debug)
}

fn apply(engine: &EngineHandle, preference: &mut BackendPreference, cmd: Command) {
    match cmd {
        Command::Start => engine.start(),
        Command::Stop => match engine.stop() {
            Ok(()) => println!("stopped"),
            Err(e) => println!("stop failed: {}", e),
        },
        Command::Panic => engine.panic(),
        Command::Sensitivity(s) => engine.set_sensitivity(s),
        Command::Key(key) => engine.set_key_override(key),
        Command::Backend(kind) => {
            engine.set_backend_override(kind);
            preference.force = kind;
            preference.save();
        }
        Command::Help => println!("{}", console::HELP),
        Command::Quit => {}
    }
}
