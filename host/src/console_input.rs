use std::{io::stdin, thread};

use tokio::sync::mpsc::{self, Receiver};

/// Stdin blocks, so lines are read on their own thread and handed over.
pub fn console_input_thread() -> Receiver<String> {
    let (sender, receiver) = mpsc::channel(100);
    thread::spawn(move || {
        pollster::block_on(console_input_loop(sender))
    });
    receiver
}

async fn console_input_loop(sender: mpsc::Sender<String>) {
    loop {
        let mut input = String::new();
        match stdin().read_line(&mut input) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if sender.send(input).await.is_err() {
            return;
        }
    }
}
