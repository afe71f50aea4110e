//! Interactive chat loop
//!
//! Reads lines from stdin while answers stream in. Only the active window's
//! text is echoed; other windows report when they finish.
//!
//! # Commands
//!
//! - `/new` - Open a new conversation window
//! - `/switch N` - Make window N active
//! - `/windows` - List windows
//! - `/close` - Remove the active window
//! - `/history` - Print the active window's messages
//! - `/source local|siliconflow` - Switch model source
//! - `/model NAME` - Select a model
//! - `/quit` - Exit

use std::io::Write;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use medqa_core::messages::{MessageRole, EMPTY_REPLY_TEXT};
use medqa_core::{ConversationStore, ModelSource, StreamEvent, StreamUpdate};

/// One line of user input
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Query(String),
    NewWindow,
    Switch(usize),
    Windows,
    Close,
    History,
    Source(ModelSource),
    Model(String),
    Quit,
    Empty,
    Invalid(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Query(line.to_string());
    };

    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, arg)| (name, arg.trim()));
    match name {
        "new" => Input::NewWindow,
        "switch" => arg
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .map_or_else(|| Input::Invalid("usage: /switch N".to_string()), Input::Switch),
        "windows" => Input::Windows,
        "close" => Input::Close,
        "history" => Input::History,
        "source" => arg.parse().map_or_else(Input::Invalid, Input::Source),
        "model" if !arg.is_empty() => Input::Model(arg.to_string()),
        "model" => Input::Invalid("usage: /model NAME".to_string()),
        "quit" | "exit" => Input::Quit,
        other => Input::Invalid(format!("unknown command /{other}")),
    }
}

fn print_windows(store: &ConversationStore) {
    let active = store.active_id();
    for (index, window) in store.windows().iter().enumerate() {
        let marker = if Some(window.id) == active { '*' } else { ' ' };
        let state = if window.is_busy() { " (生成中)" } else { "" };
        println!("{marker} {}. {}{state}", index + 1, window.title);
    }
}

fn print_history(store: &ConversationStore) {
    let Some(window) = store.active_window() else {
        println!("没有打开的对话窗口");
        return;
    };
    for message in window.messages() {
        let who = match message.role {
            MessageRole::User => "你",
            MessageRole::Assistant => "助手",
        };
        println!("{who}: {}", message.content);
    }
}

/// Echo one applied update
fn render(store: &ConversationStore, update: &StreamUpdate) -> Result<()> {
    let mut stdout = std::io::stdout();
    let is_active = store.active_id() == Some(update.window_id);

    match &update.event {
        StreamEvent::Delta { text } if is_active => write!(stdout, "{text}")?,
        StreamEvent::Error { message } if is_active => write!(stdout, "\n{message}")?,
        StreamEvent::Done => {
            if is_active {
                let finished = store
                    .window(update.window_id)
                    .and_then(|w| w.message(&update.message_id));
                if finished.is_some_and(|m| m.content == EMPTY_REPLY_TEXT) {
                    write!(stdout, "{EMPTY_REPLY_TEXT}")?;
                }
                writeln!(stdout)?;
            } else if let Some(window) = store.window(update.window_id) {
                println!("[{} 回答完成]", window.title);
            }
        }
        _ => {}
    }
    stdout.flush()?;
    Ok(())
}

async fn handle(store: &mut ConversationStore, input: Input) -> bool {
    match input {
        Input::Query(query) => {
            if let Err(e) = store.send_active(&query) {
                eprintln!("无法发送: {e}");
            }
        }
        Input::NewWindow => {
            store.new_window();
            print_windows(store);
        }
        Input::Switch(n) => match store.windows().get(n - 1).map(|w| w.id) {
            Some(id) => {
                store.set_active(id);
                print_history(store);
            }
            None => eprintln!("没有第 {n} 个窗口"),
        },
        Input::Windows => print_windows(store),
        Input::Close => {
            if let Some(id) = store.active_id() {
                store.remove_window(id);
            }
            if store.windows().is_empty() {
                store.new_window();
            }
            print_windows(store);
        }
        Input::History => print_history(store),
        Input::Source(source) => {
            if store.catalog().is_empty() {
                store.refresh_models().await;
            }
            store.set_model_source(source);
            println!("模型: {:?}", store.selection().model_name);
        }
        Input::Model(name) => store.selection_mut().model_name = Some(name),
        Input::Quit => return false,
        Input::Empty => {}
        Input::Invalid(message) => eprintln!("{message}"),
    }
    true
}

/// Run the chat loop until `/quit` or end of input
pub async fn run(store: &mut ConversationStore) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_windows(store);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    // End of input: let in-flight answers finish
                    store.run_until_idle().await;
                    break;
                };
                if !handle(store, parse_input(&line)).await {
                    break;
                }
            }
            Some(update) = store.pump() => render(store, &update)?,
        }
    }

    tracing::debug!("Chat loop finished");
    Ok(())
}
