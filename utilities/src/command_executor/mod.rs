use std::{
    io,
    sync::mpsc::{Receiver, Sender},
    thread::JoinHandle,
};

use tokio::sync::oneshot;
use tracing::{debug, warn};

pub trait Command: Send + std::fmt::Debug {
    type Response: Send;
    type Handler: DeviceHandler<Command = Self>;

    fn execute(self, handler: &mut Self::Handler) -> io::Result<Self::Response>;
}

pub trait DeviceHandler {
    type Command: Command<Handler = Self>;

    fn name(&self) -> &str;
}

pub struct GenericCommand<C: Command> {
    command: C,
    response_ch: oneshot::Sender<io::Result<C::Response>>,
}

impl<C: Command> GenericCommand<C> {
    pub fn new(command: C, response_ch: oneshot::Sender<io::Result<C::Response>>) -> Self {
        Self {
            command,
            response_ch,
        }
    }

    pub fn execute(self, handler: &mut C::Handler) -> io::Result<()> {
        let description = format!("{:?}", self.command);
        let result = self.command.execute(handler);

        if let Err(e) = &result {
            warn!(device = handler.name(), command = %description, "Command failed: {}", e);
        }

        self.response_ch
            .send(result)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "Failed to send response"))
    }
}

/// Owns a device handler and serves commands for it, one at a time, on the
/// thread that calls [`CommandExecutor::run`].
pub struct CommandExecutor<H: DeviceHandler + Send + 'static> {
    handler: H,
    commands_ch: Receiver<GenericCommand<H::Command>>,
    sender: Sender<GenericCommand<H::Command>>,
}

impl<H: DeviceHandler + Send> CommandExecutor<H> {
    pub fn new(handler: H) -> Self {
        let (sender, commands_ch) = std::sync::mpsc::channel();

        Self {
            handler,
            commands_ch,
            sender,
        }
    }

    pub fn sender(&self) -> CommandSender<H::Command> {
        CommandSender::new(self.sender.clone())
    }

    /// Serves commands until every [`CommandSender`] has been dropped.
    pub fn run(self) -> io::Result<()> {
        let Self {
            mut handler,
            commands_ch,
            sender,
        } = self;
        // Only external senders keep the executor alive.
        drop(sender);

        while let Ok(command) = commands_ch.recv() {
            if command.execute(&mut handler).is_err() {
                debug!(
                    device = handler.name(),
                    "Caller went away before the response was delivered"
                );
            }
        }

        debug!(device = handler.name(), "Command executor finished");
        Ok(())
    }

    pub fn spawn(self) -> io::Result<JoinHandle<io::Result<()>>> {
        let name = format!("{}-executor", self.handler.name());
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
    }
}

pub struct CommandSender<T: Command> {
    commands_ch: Sender<GenericCommand<T>>,
}

impl<C: Command> Clone for CommandSender<C> {
    fn clone(&self) -> Self {
        Self {
            commands_ch: self.commands_ch.clone(),
        }
    }
}

impl<C: Command> CommandSender<C> {
    pub fn new(commands_ch: Sender<GenericCommand<C>>) -> Self {
        Self { commands_ch }
    }

    fn enqueue(&self, command: C) -> io::Result<oneshot::Receiver<io::Result<C::Response>>> {
        let (response_ch, response_rx) = oneshot::channel();
        let command = GenericCommand::new(command, response_ch);

        self.commands_ch
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "Failed to send command"))?;

        Ok(response_rx)
    }

    pub async fn send_command(&self, command: C) -> io::Result<C::Response> {
        let response_rx = self.enqueue(command)?;

        response_rx
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "Failed to receive response"))?
    }

    /// Blocks the calling thread until the device thread has answered.
    ///
    /// Must not be called from inside an async task.
    pub fn send_command_blocking(&self, command: C) -> io::Result<C::Response> {
        let response_rx = self.enqueue(command)?;

        response_rx
            .blocking_recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "Failed to receive response"))?
    }
}
