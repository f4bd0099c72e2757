mod config;
mod controller;
mod device;
mod directory;
mod error;
#[cfg(test)]
mod http_stub;
mod mailbox;
mod pcm;
mod protocol;
mod session;
mod stats;
mod transport;

use clap::Parser;
use config::Config;
use controller::{ SessionController, SessionHandle };
use device::{ MicPermission, RawFilePlayback, SyntheticCapture };
use directory::DirectoryClient;
use mailbox::MailboxClient;
use stats::Stats;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{ AsyncBufReadExt, BufReader };
use tracing::{ debug, error, info, warn };

const HELP: &str =
    "commands: connect | disconnect | talk | release | switch <channel> | create | channels | refresh | \
background | active | interrupt | resume | status | log | \
send <user> | inbox | fetch <file> | quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber
        ::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter
                ::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let config = Config::parse();

    let directory = DirectoryClient::new(config.directory_url()?, config.connect_timeout())?;
    let mailbox = MailboxClient::new(config.mailbox_url()?, config.connect_timeout())?;
    info!(
        host = %config.host,
        channel = %config.initial_channel(),
        control = %config.control_url(&config.initial_channel())?,
        directory = %directory.url(),
        shared_link = config.shared_link,
        sample_rate = config.sample_rate,
        "🚀 walkie-talkie client starting"
    );

    let stats = Stats::new();

    // Spawn stats reporter
    let stats_clone = stats.clone();
    let stats_interval = config.stats_interval_secs;
    tokio::spawn(async move {
        stats::stats_reporter(stats_clone, stats_interval).await;
    });

    let permission = if config.deny_microphone { MicPermission::Denied } else { MicPermission::Granted };
    let capture = SyntheticCapture::new(config.audio_format(), config.frame_samples, config.tone_hz, permission);
    let playback = RawFilePlayback::new(config.playback_file.clone());
    // separate tap for mailbox takes; the live one belongs to the controller
    let take_capture = SyntheticCapture::new(config.audio_format(), config.frame_samples, config.tone_hz, permission);

    let (session, controller_task) = SessionController::spawn(
        config.clone(),
        Box::new(capture),
        Box::new(playback),
        directory,
        stats
    );

    let mut state = session.subscribe();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let snap = state.borrow_and_update().clone();
            debug!(
                connection = %snap.connection,
                talk = %snap.talk,
                channel = %snap.selected_channel,
                requesting = snap.is_requesting,
                "📡 session state"
            );
        }
    });

    if let Err(e) = session.connect().await {
        warn!(error = %e, "initial connect failed, use `connect` to retry");
    }
    match session.refresh_directory().await {
        Ok(channels) => info!(channels = ?channels, "📒 channels"),
        Err(e) => warn!(error = %e, "channel directory unavailable"),
    }

    let mut console = Console {
        session: session.clone(),
        mailbox,
        take_capture,
        user: config.user.clone(),
        format: config.audio_format(),
        take_length: config.take_length(),
        mailbox_dir: config.mailbox_dir.clone(),
    };

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !console.run(line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    session.shutdown();
    let _ = controller_task.await;
    info!("👋 walkie-talkie client stopped");
    Ok(())
}

/// Interactive command surface.
struct Console {
    session: SessionHandle,
    mailbox: MailboxClient,
    take_capture: SyntheticCapture,
    user: String,
    format: pcm::AudioFormat,
    take_length: Duration,
    mailbox_dir: PathBuf,
}

impl Console {
    /// Run one console command.  Returns `false` to quit.
    async fn run(&mut self, line: &str) -> bool {
        let session = self.session.clone();
        let (cmd, arg) = match line.split_once(' ') {
            Some((cmd, arg)) => (cmd, arg.trim()),
            None => (line, ""),
        };

        match cmd {
            "" => {}
            "connect" => report("connect", session.connect().await),
            "disconnect" => report("disconnect", session.disconnect().await),
            "talk" => report("talk", session.press_talk().await),
            "release" => report("release", session.release_talk().await),
            "switch" if !arg.is_empty() => report("switch", session.switch_channel(arg).await),
            "create" => report("create", session.create_channel().await),
            "channels" => println!("{}", session.snapshot().channels.join("\n")),
            "refresh" => report("refresh", session.refresh_directory().await),
            "background" => session.entered_background(),
            "active" => session.became_active(),
            "interrupt" => session.audio_interrupted(),
            "resume" => session.audio_interruption_ended(),
            "status" => {
                match serde_json::to_string_pretty(&session.snapshot()) {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!(error = %e, "status encode failed"),
                }
            }
            "log" => {
                if let Ok(entries) = session.log().await {
                    for entry in entries {
                        println!("{}", entry);
                    }
                }
            }
            "send" if !arg.is_empty() => {
                let result = self.send_take(arg).await;
                report("send", result);
            }
            "inbox" => report("inbox", self.mailbox.list(&self.user).await),
            "fetch" if !arg.is_empty() => {
                let result = self.mailbox.save(arg, &self.mailbox_dir).await;
                report("fetch", result);
            }
            "quit" | "exit" => {
                return false;
            }
            _ => println!("{}", HELP),
        }
        true
    }

    async fn send_take(&mut self, receiver: &str) -> Result<mailbox::VoiceMessage, error::MailboxError> {
        println!("recording {:.0}s for {}...", self.take_length.as_secs_f32(), receiver);
        let buffers = mailbox::record_take(&mut self.take_capture, self.take_length).await?;
        let wav = mailbox::encode_take(&buffers, &self.format)?;
        self.mailbox.send(&self.user, receiver, wav).await
    }
}

fn report<T: std::fmt::Debug, E: std::fmt::Display>(what: &str, result: Result<T, E>) {
    match result {
        Ok(value) => println!("{}: ok {:?}", what, value),
        Err(e) => println!("{}: {}", what, e),
    }
}
