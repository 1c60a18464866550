use std::{io::{stdin, stdout, Write}, thread};

use tokio::sync::mpsc::{self, Receiver};

pub fn console_input_thread() -> Receiver<String> {
    let (sender, receiver) = mpsc::channel(16);
    thread::spawn(move || {
        pollster::block_on(prompt_loop(sender))
    });
    receiver
}

async fn prompt_loop(sender: mpsc::Sender<String>) {
    loop {
        print!("> ");
        let _ = stdout().flush();

        let mut input = String::new();
        match stdin().read_line(&mut input) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if input.trim().is_empty() {
            continue;
        }
        if sender.send(input).await.is_err() {
            return;
        }
    }
}
