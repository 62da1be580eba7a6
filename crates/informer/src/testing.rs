//! Scripted in-memory `ListWatch` for exercising reflectors and informers.

use std::collections::VecDeque;

use futures::channel::mpsc;
use futures::stream::{self, StreamExt};
use mirra_core::{Error, ListOptions, ListWatch, Object, ObjectList, Result, WatchEvent, WatchStream};
use parking_lot::Mutex;

enum WatchScript<K> {
    Events { items: Vec<Result<WatchEvent<K>>>, close: bool },
    Fail(Error),
    Live(mpsc::UnboundedReceiver<Result<WatchEvent<K>>>),
}

/// Each `list`/`watch` call consumes the next scripted response.
///
/// An exhausted list script answers with a transport error; an exhausted watch
/// script answers with a stream that stays open and silent.
pub struct FakeListWatch<K> {
    name: String,
    lists: Mutex<VecDeque<Result<ObjectList<K>>>>,
    watches: Mutex<VecDeque<WatchScript<K>>>,
    list_calls: Mutex<Vec<ListOptions>>,
    watch_calls: Mutex<Vec<ListOptions>>,
}

impl<K: Object> FakeListWatch<K> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lists: Mutex::new(VecDeque::new()),
            watches: Mutex::new(VecDeque::new()),
            list_calls: Mutex::new(Vec::new()),
            watch_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_list(&self, items: Vec<K>, resource_version: &str) {
        self.lists.lock().push_back(Ok(ObjectList { items, resource_version: resource_version.to_string() }));
    }

    pub fn push_list_error(&self, err: Error) {
        self.lists.lock().push_back(Err(err));
    }

    /// A watch delivering `events` and then staying open.
    pub fn push_watch(&self, events: Vec<WatchEvent<K>>) {
        self.push_watch_items(events.into_iter().map(Ok).collect(), false);
    }

    /// A watch delivering `events` and then closing cleanly.
    pub fn push_watch_then_close(&self, events: Vec<WatchEvent<K>>) {
        self.push_watch_items(events.into_iter().map(Ok).collect(), true);
    }

    /// Raw stream items, including `Err` entries.
    pub fn push_watch_items(&self, items: Vec<Result<WatchEvent<K>>>, close: bool) {
        self.watches.lock().push_back(WatchScript::Events { items, close });
    }

    /// The next watch call itself fails.
    pub fn push_watch_error(&self, err: Error) {
        self.watches.lock().push_back(WatchScript::Fail(err));
    }

    /// The next watch streams whatever is sent on the returned channel.
    pub fn push_live_watch(&self) -> mpsc::UnboundedSender<Result<WatchEvent<K>>> {
        let (tx, rx) = mpsc::unbounded();
        self.watches.lock().push_back(WatchScript::Live(rx));
        tx
    }

    pub fn list_calls(&self) -> Vec<ListOptions> {
        self.list_calls.lock().clone()
    }

    pub fn watch_calls(&self) -> Vec<ListOptions> {
        self.watch_calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl<K: Object> ListWatch<K> for FakeListWatch<K> {
    async fn list(&self, opts: &ListOptions) -> Result<ObjectList<K>> {
        self.list_calls.lock().push(opts.clone());
        let next = self.lists.lock().pop_front();
        next.unwrap_or_else(|| Err(Error::Transport("no scripted list response".to_string())))
    }

    async fn watch(&self, opts: &ListOptions) -> Result<WatchStream<K>> {
        self.watch_calls.lock().push(opts.clone());
        let next = self.watches.lock().pop_front();
        match next {
            Some(WatchScript::Events { items, close: true }) => Ok(stream::iter(items).boxed()),
            Some(WatchScript::Events { items, close: false }) => {
                Ok(stream::iter(items).chain(stream::pending()).boxed())
            }
            Some(WatchScript::Fail(e)) => Err(e),
            Some(WatchScript::Live(rx)) => Ok(rx.boxed()),
            None => Ok(stream::pending().boxed()),
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
