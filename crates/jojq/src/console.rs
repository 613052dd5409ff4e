//! Line-oriented operator console
//!
//! The controlling terminal doubles as the control channel: a decimal
//! number selects a capture for inspection, `list` summarizes the buffer,
//! `save` exports records to disk, `clear` empties the buffer and
//! `exit`/`quit` ends the session.

use jojq_proxy::{export_record, export_records, CaptureBuffer};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Run the console until the operator exits or stdin closes.
pub async fn run(buffer: Arc<CaptureBuffer>) {
  let stdin = tokio::io::stdin();
  let mut lines = BufReader::new(stdin).lines();
  println!("type 'help' for commands");

  while let Ok(Some(line)) = lines.next_line().await {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }
    let mut words = line.split_whitespace();
    match words.next().unwrap_or_default() {
      "exit" | "quit" => break,
      "help" => print_help(),
      "list" | "ls" => list(&buffer),
      "clear" => {
        buffer.clear();
        println!("capture buffer cleared");
      }
      "save" => save(&buffer, words.next(), words.next()),
      word => match word.parse::<usize>() {
        Ok(position) => show(&buffer, position),
        Err(_) => println!("unknown command {word:?}, type 'help'"),
      },
    }
  }
}

fn show(buffer: &CaptureBuffer, position: usize) {
  match buffer.get(position) {
    Some(record) => match serde_json::to_string_pretty(&record) {
      Ok(text) => println!("{text}"),
      Err(e) => println!("failed to render capture {position}: {e}"),
    },
    None => println!("no capture at position {position} (1..{})", buffer.len()),
  }
}

fn list(buffer: &CaptureBuffer) {
  let records = buffer.list();
  if records.is_empty() {
    println!("no captures yet");
    return;
  }
  for (index, record) in records.iter().enumerate() {
    println!("[{}] {}", index + 1, record.summary());
  }
}

fn save(buffer: &CaptureBuffer, selector: Option<&str>, dir: Option<&str>) {
  let dir = Path::new(dir.unwrap_or("."));
  match selector {
    Some("all") => {
      let records = buffer.list();
      if records.is_empty() {
        println!("nothing to save");
        return;
      }
      match export_records(dir, &records) {
        Ok(path) => println!("saved {} captures to {}", records.len(), path.display()),
        Err(e) => println!("save failed: {e}"),
      }
    }
    Some(position) => match position.parse::<usize>() {
      Ok(position) => match buffer.get(position) {
        Some(record) => match export_record(dir, &record) {
          Ok(path) => println!("saved capture {position} to {}", path.display()),
          Err(e) => println!("save failed: {e}"),
        },
        None => println!("no capture at position {position}"),
      },
      Err(_) => println!("usage: save <n>|all [dir]"),
    },
    None => println!("usage: save <n>|all [dir]"),
  }
}

fn print_help() {
  println!("commands:");
  println!("  <n>             show capture n as JSON");
  println!("  list, ls        list captured exchanges");
  println!("  save <n> [dir]  export capture n to a JSON file");
  println!("  save all [dir]  export every capture as a JSON array");
  println!("  clear           empty the capture buffer");
  println!("  help            show this message");
  println!("  exit, quit      stop the proxy and leave");
}
