//! Minimal interactive shell over the prybar debugger.
//!
//! Usage: `prybar-shell <process-name> [path-to-create]`. Attaches to the
//! named process, or creates the given image when no such process is
//! running, then drives it with single-line commands.

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        use prybar::os::windows::WindowsPlatform;
        use prybar::os::Platform;
        use prybar::{Debugger, Error, EventLogger, Process, Settings};
        use std::io::{BufRead, Write};
        use std::sync::Arc;
        use std::time::Duration;

        fn main() {
            env_logger::init();

            let mut args = std::env::args().skip(1);
            let Some(name) = args.next() else {
                eprintln!("usage: prybar-shell <process-name> [path-to-create]");
                std::process::exit(2);
            };
            let create_path = args.next();

            let platform: Arc<dyn Platform> = Arc::new(WindowsPlatform::new());
            let debugger = match open_or_create(platform, &name, create_path.as_deref()) {
                Ok(debugger) => debugger,
                Err(err) => {
                    eprintln!("failed to open target: {err}");
                    std::process::exit(1);
                }
            };

            if debugger.wait_for_initial_breakpoint(Duration::from_secs(10)) {
                println!("initial breakpoint observed; target is running");
            } else {
                println!("no initial breakpoint yet; continuing anyway");
            }

            shell(debugger);
        }

        fn open_or_create(
            platform: Arc<dyn Platform>,
            name: &str,
            create_path: Option<&str>,
        ) -> Result<Debugger, Error> {
            let process = Arc::new(Process::new(Arc::clone(&platform)));
            match process.open_by_name(name) {
                Ok(()) => {
                    println!("attached to {name} (pid {})", process.pid()?);
                    Debugger::attach(process, Settings::default(), Box::new(EventLogger))
                }
                Err(Error::ProcessNotFound { .. }) => {
                    let path = create_path.unwrap_or(name);
                    println!("{name} not running; creating {path}");
                    Debugger::launch(
                        platform,
                        path,
                        "",
                        true,
                        Settings::default(),
                        Box::new(EventLogger),
                    )
                }
                Err(err) => Err(err),
            }
        }

        fn shell(mut debugger: Debugger) {
            let stdin = std::io::stdin();
            let mut lines = stdin.lock().lines();
            loop {
                print!("> ");
                let _ = std::io::stdout().flush();
                let Some(Ok(line)) = lines.next() else { break };

                match line.trim() {
                    "" => {}
                    "p" => match debugger.pause() {
                        Ok(()) => {
                            if debugger.wait_until_paused(Duration::from_secs(5)) {
                                report_stop(&debugger);
                            } else {
                                println!("target did not stop in time");
                            }
                        }
                        Err(err) => println!("pause failed: {err}"),
                    },
                    "g" | "r" => match debugger.resume() {
                        Ok(()) => println!("running"),
                        Err(err) => println!("resume failed: {err}"),
                    },
                    "si" => step(&debugger, Debugger::step_into),
                    "so" => step(&debugger, Debugger::step_over),
                    "d" => match debugger.disassemble_current(8) {
                        Ok(listing) => {
                            for line in listing {
                                println!("{line}");
                            }
                        }
                        Err(err) => println!("disassembly failed: {err}"),
                    },
                    "q" | "exit" | "quit" => break,
                    other => {
                        println!("unknown command {other:?}");
                        println!("commands: p pause, g/r resume, si step into, so step over, d disassemble, q quit");
                    }
                }

                if debugger.target_exited() {
                    println!("target exited");
                    break;
                }
            }
            debugger.stop();
        }

        fn step(debugger: &Debugger, op: fn(&Debugger) -> Result<(), Error>) {
            match op(debugger) {
                Ok(()) => {
                    if debugger.wait_until_paused(Duration::from_secs(5)) {
                        report_stop(debugger);
                    } else {
                        println!("step did not complete in time");
                    }
                }
                Err(err) => println!("step failed: {err}"),
            }
        }

        fn report_stop(debugger: &Debugger) {
            match debugger.context() {
                Ok(context) => {
                    println!("stopped at {:#x}", context.ip);
                    if let Ok(listing) = debugger.disassemble_current(1) {
                        for line in listing {
                            println!("{line}");
                        }
                    }
                }
                Err(err) => println!("stopped, but no context: {err}"),
            }
        }
    } else {
        fn main() {
            eprintln!("prybar-shell drives the Windows debug API and only runs on Windows hosts");
            std::process::exit(1);
        }
    }
}
