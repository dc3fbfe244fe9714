use std::collections::VecDeque;
use std::time::Duration;

use interay::{
    Access, MethodHandler, NetContext, NetError, NetworkEntity, NetworkManager, PeerId, Recipient,
    Value,
};

const HISTORY: usize = 64;

/// Host entity of the demo node: a single chat room.
pub struct ChatRoom {
    name: String,
    history: VecDeque<String>,
    ping_every: u32,
    ticks: u32,
    pongs: u32,
}

impl ChatRoom {
    pub fn new(name: impl Into<String>, ping_every: u32) -> Self {
        Self {
            name: name.into(),
            history: VecDeque::with_capacity(HISTORY),
            ping_every,
            ticks: 0,
            pongs: 0,
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    pub fn pongs(&self) -> u32 {
        self.pongs
    }

    fn remember(&mut self, line: String) {
        log::info!("{}", line);
        if self.history.len() == HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(line);
    }

    /// A server relays what its clients say; everyone else prints it.
    fn say(&mut self, ctx: &mut NetContext<'_>, data: Value) -> interay::Result<()> {
        let text = text_of(&data)?;
        match ctx.sender() {
            Some(peer) if ctx.is_server() => {
                let line = format!("<{}> {}", peer, text);
                ctx.send("say", Some(Value::from(line.as_str())), Recipient::Broadcast);
                if !ctx.is_client() {
                    self.remember(line);
                }
            }
            _ => self.remember(text.to_string()),
        }
        Ok(())
    }

    fn ping(&mut self, ctx: &mut NetContext<'_>) -> interay::Result<()> {
        let peer = ctx
            .sender()
            .ok_or_else(|| NetError::entity("ping without a sender"))?;
        ctx.send("pong", None, Recipient::Peer(peer.0.into()));
        Ok(())
    }

    fn pong(&mut self, _ctx: &mut NetContext<'_>, _recipient: u64) -> interay::Result<()> {
        self.pongs += 1;
        log::debug!("pong #{}", self.pongs);
        Ok(())
    }

    /// Clients address a peer; the server forwards to that peer only.
    fn whisper(&mut self, ctx: &mut NetContext<'_>, data: Value, recipient: u64) -> interay::Result<()> {
        let text = text_of(&data)?;
        match ctx.sender() {
            Some(peer) if ctx.is_server() => {
                let line = format!("<{} whispers> {}", peer, text);
                ctx.send("whisper", Some(Value::from(line.as_str())), Recipient::Peer(recipient));
            }
            _ => self.remember(text.to_string()),
        }
        Ok(())
    }
}

fn text_of(data: &Value) -> interay::Result<&str> {
    data.as_str()
        .ok_or_else(|| NetError::entity(format!("expected a string, got {:?}", data.tag())))
}

impl NetworkEntity for ChatRoom {
    fn on_tick(&mut self, ctx: &mut NetContext<'_>, _delta: Duration) -> interay::Result<()> {
        if !ctx.is_client() || ctx.is_server() || self.ping_every == 0 {
            return Ok(());
        }
        self.ticks += 1;
        if self.ticks % self.ping_every == 0 {
            ctx.send("ping", None, Recipient::Broadcast);
        }
        Ok(())
    }

    fn on_client_connect(&mut self, ctx: &mut NetContext<'_>, peer: PeerId) -> interay::Result<()> {
        if ctx.is_server() {
            log::info!("Peer {} joined {}", peer, self.name);
            return Ok(());
        }
        let hello = format!("{} joined", self.name);
        ctx.send("say", Some(Value::from(hello.as_str())), Recipient::Broadcast);
        Ok(())
    }

    fn on_client_disconnect(&mut self, ctx: &mut NetContext<'_>, peer: PeerId) -> interay::Result<()> {
        if ctx.is_server() {
            let line = format!("<{}> left", peer);
            ctx.send("say", Some(Value::from(line.as_str())), Recipient::Broadcast);
        } else {
            log::warn!("Lost the server");
        }
        Ok(())
    }

    fn on_start_host(&mut self, _ctx: &mut NetContext<'_>) -> interay::Result<()> {
        log::info!("Room {} is open", self.name);
        Ok(())
    }

    fn on_stop_host(&mut self, ctx: &mut NetContext<'_>) -> interay::Result<()> {
        ctx.send("say", Some(Value::from("room closing")), Recipient::Broadcast);
        Ok(())
    }
}

pub fn register(manager: &mut NetworkManager) -> interay::Result<()> {
    manager.register_method(
        "say",
        Access::default(),
        MethodHandler::data(ChatRoom::say),
    )?;
    manager.register_method(
        "ping",
        Access::ALLOW_CLIENT,
        MethodHandler::unit(ChatRoom::ping),
    )?;
    manager.register_method(
        "pong",
        Access::ALLOW_SERVER,
        MethodHandler::recipient(ChatRoom::pong),
    )?;
    manager.register_method(
        "whisper",
        Access::default(),
        MethodHandler::data_recipient(ChatRoom::whisper),
    )?;
    Ok(())
}
