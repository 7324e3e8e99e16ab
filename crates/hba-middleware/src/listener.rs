//! Listener Registry – who receives the records of each channel.
//!
//! A [`Listener`] is registered against one [`Channel`] and receives every
//! record decoded on that channel's link, in registration order.  Listeners
//! react synchronously and return the commands they want issued; the bus
//! sends them before it looks at the next ready link.
//!
//! The registry keeps an explicit reference count per channel.  Only the
//! 0→1 and 1→0 transitions are reported, so the bus issues the hardware
//! enable/disable commands exactly once per transition.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use hba_types::{Channel, Command, HbaError, Record};
use tokio::sync::mpsc;

/// Handle returned by a registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerToken(u64);

impl fmt::Display for ListenerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A consumer of channel records.
pub trait Listener {
    /// A record arrived on `channel`.  Returned commands are issued in order.
    fn on_record(&mut self, channel: &Channel, record: &Record) -> Vec<Command>;

    /// The link carrying `channel` was lost.  The listener has been removed
    /// from the registry when this is called.
    fn on_closed(&mut self, _channel: &Channel) -> Vec<Command> {
        Vec::new()
    }

    /// The bus is shutting down.
    fn on_shutdown(&mut self) -> Vec<Command> {
        Vec::new()
    }
}

/// Lets one listener (e.g. an arbiter) be registered on several channels.
impl<L: Listener + ?Sized> Listener for Rc<RefCell<L>> {
    fn on_record(&mut self, channel: &Channel, record: &Record) -> Vec<Command> {
        self.borrow_mut().on_record(channel, record)
    }

    fn on_closed(&mut self, channel: &Channel) -> Vec<Command> {
        self.borrow_mut().on_closed(channel)
    }

    fn on_shutdown(&mut self) -> Vec<Command> {
        self.borrow_mut().on_shutdown()
    }
}

/// What a [`QueueListener`] forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Record { channel: Channel, record: Record },
    Closed { channel: Channel },
}

/// Forwards records into an unbounded queue.
pub struct QueueListener {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl QueueListener {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Listener for QueueListener {
    fn on_record(&mut self, channel: &Channel, record: &Record) -> Vec<Command> {
        // A dropped receiver just means nobody is reading any more.
        let _ = self.tx.send(Delivery::Record {
            channel: channel.clone(),
            record: record.clone(),
        });
        Vec::new()
    }

    fn on_closed(&mut self, channel: &Channel) -> Vec<Command> {
        let _ = self.tx.send(Delivery::Closed {
            channel: channel.clone(),
        });
        Vec::new()
    }
}

/// Wraps a closure as a listener.
pub struct FnListener<F>(pub F);

impl<F> Listener for FnListener<F>
where
    F: FnMut(&Channel, &Record) -> Vec<Command>,
{
    fn on_record(&mut self, channel: &Channel, record: &Record) -> Vec<Command> {
        (self.0)(channel, record)
    }
}

/// Cardinality change caused by an insert or removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 0 → 1: the channel must be enabled.
    Activated,
    /// No edge crossed.
    Unchanged,
    /// 1 → 0: the channel must be disabled.
    Deactivated,
}

type Slot = (ListenerToken, Box<dyn Listener>);

/// Per-channel listener lists plus their reference counts.
#[derive(Default)]
pub struct ListenerRegistry {
    next_token: u64,
    slots: BTreeMap<Channel, Vec<Slot>>,
    counts: HashMap<Channel, usize>,
    owners: HashMap<ListenerToken, Channel>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, channel: Channel, listener: Box<dyn Listener>) -> (ListenerToken, Transition) {
        self.next_token += 1;
        let token = ListenerToken(self.next_token);

        let count = self.counts.entry(channel.clone()).or_insert(0);
        *count += 1;
        let transition = if *count == 1 {
            Transition::Activated
        } else {
            Transition::Unchanged
        };

        self.owners.insert(token, channel.clone());
        self.slots.entry(channel).or_default().push((token, listener));
        (token, transition)
    }

    pub fn remove(&mut self, token: ListenerToken) -> Result<(Channel, Box<dyn Listener>, Transition), HbaError> {
        let channel = self
            .owners
            .remove(&token)
            .ok_or(HbaError::UnknownListener(token.0))?;

        let slots = self.slots.entry(channel.clone()).or_default();
        let index = slots
            .iter()
            .position(|(t, _)| *t == token)
            .ok_or(HbaError::UnknownListener(token.0))?;
        let (_, listener) = slots.remove(index);
        if slots.is_empty() {
            self.slots.remove(&channel);
        }

        let transition = match self.counts.get_mut(&channel) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Transition::Unchanged
            }
            Some(_) => {
                self.counts.remove(&channel);
                Transition::Deactivated
            }
            None => Transition::Unchanged,
        };
        Ok((channel, listener, transition))
    }

    /// Deliver `record` to every listener of `channel` in registration order.
    pub fn dispatch(&mut self, channel: &Channel, record: &Record) -> Vec<Command> {
        let mut commands = Vec::new();
        if let Some(slots) = self.slots.get_mut(channel) {
            for (_, listener) in slots.iter_mut() {
                commands.extend(listener.on_record(channel, record));
            }
        }
        commands
    }

    /// Drop every listener of `channel` after telling it the link is gone.
    pub fn close_channel(&mut self, channel: &Channel) -> Vec<Command> {
        self.counts.remove(channel);
        let mut commands = Vec::new();
        for (token, mut listener) in self.slots.remove(channel).unwrap_or_default() {
            self.owners.remove(&token);
            commands.extend(listener.on_closed(channel));
        }
        commands
    }

    /// Tell every listener the bus is shutting down and forget them all.
    pub fn shutdown_all(&mut self) -> Vec<Command> {
        self.counts.clear();
        self.owners.clear();
        let mut commands = Vec::new();
        for (_, slots) in std::mem::take(&mut self.slots) {
            for (_, mut listener) in slots {
                commands.extend(listener.on_shutdown());
            }
        }
        commands
    }

    pub fn count(&self, channel: &Channel) -> usize {
        self.counts.get(channel).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qtr() -> Channel {
        Channel::new("hba_qtr", "qtr")
    }

    fn quad() -> Channel {
        Channel::new("hba_quad", "enc1")
    }

    fn tagging(tag: &'static str) -> Box<dyn Listener> {
        Box::new(FnListener(move |_: &Channel, _: &Record| {
            vec![Command::set("log", "tag", tag)]
        }))
    }

    #[test]
    fn transitions_only_on_zero_crossings() {
        let mut reg = ListenerRegistry::new();
        let (a, t1) = reg.insert(qtr(), tagging("a"));
        let (b, t2) = reg.insert(qtr(), tagging("b"));
        assert_eq!(t1, Transition::Activated);
        assert_eq!(t2, Transition::Unchanged);
        assert_eq!(reg.count(&qtr()), 2);

        assert_eq!(reg.remove(a).unwrap().2, Transition::Unchanged);
        assert_eq!(reg.remove(b).unwrap().2, Transition::Deactivated);
        assert_eq!(reg.count(&qtr()), 0);

        let (_, again) = reg.insert(qtr(), tagging("c"));
        assert_eq!(again, Transition::Activated);
    }

    #[test]
    fn interleaved_sequences_never_double_issue() {
        let mut reg = ListenerRegistry::new();
        let mut activations = 0;
        let mut deactivations = 0;
        let mut live = Vec::new();
        // Register three, drop two, register one, drop all.
        for step in [true, true, true, false, false, true, false, false] {
            if step {
                let (token, t) = reg.insert(qtr(), tagging("x"));
                live.push(token);
                if t == Transition::Activated {
                    activations += 1;
                }
            } else {
                let token = live.remove(0);
                if reg.remove(token).unwrap().2 == Transition::Deactivated {
                    deactivations += 1;
                }
            }
        }
        assert_eq!(activations, 1);
        assert_eq!(deactivations, 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn dispatch_follows_registration_order_per_channel() {
        let mut reg = ListenerRegistry::new();
        reg.insert(qtr(), tagging("first"));
        reg.insert(quad(), tagging("other"));
        reg.insert(qtr(), tagging("second"));

        let commands = reg.dispatch(&qtr(), &Record::from_line("ff 00"));
        let tags: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
        assert_eq!(tags, vec!["hbaset log tag first", "hbaset log tag second"]);
    }

    #[test]
    fn unknown_token_is_an_error() {
        let mut reg = ListenerRegistry::new();
        let (token, _) = reg.insert(qtr(), tagging("a"));
        reg.remove(token).unwrap();
        assert!(matches!(reg.remove(token), Err(HbaError::UnknownListener(_))));
    }

    #[test]
    fn close_channel_notifies_and_resets_count() {
        let mut reg = ListenerRegistry::new();
        let (listener, mut rx) = QueueListener::channel();
        let (token, _) = reg.insert(qtr(), Box::new(listener));
        reg.insert(quad(), tagging("keep"));

        reg.close_channel(&qtr());
        assert_eq!(rx.try_recv().unwrap(), Delivery::Closed { channel: qtr() });
        assert_eq!(reg.count(&qtr()), 0);
        assert_eq!(reg.count(&quad()), 1);
        assert!(reg.remove(token).is_err());
    }

    #[test]
    fn shared_listener_sees_both_channels() {
        struct Counter(usize);
        impl Listener for Counter {
            fn on_record(&mut self, _: &Channel, _: &Record) -> Vec<Command> {
                self.0 += 1;
                Vec::new()
            }
        }

        let shared = Rc::new(RefCell::new(Counter(0)));
        let mut reg = ListenerRegistry::new();
        reg.insert(qtr(), Box::new(shared.clone()));
        reg.insert(quad(), Box::new(shared.clone()));
        reg.dispatch(&qtr(), &Record::default());
        reg.dispatch(&quad(), &Record::default());
        assert_eq!(shared.borrow().0, 2);
    }

    #[test]
    fn queue_listener_forwards_records() {
        let (mut listener, mut rx) = QueueListener::channel();
        let record = Record::from_line("0032");
        assert!(listener.on_record(&quad(), &record).is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            Delivery::Record {
                channel: quad(),
                record
            }
        );
    }
}
