use std::cell::Cell;
use std::fmt;

#[derive(PartialEq,Eq,PartialOrd,Ord,Hash,Debug,Clone,Copy,serde::Serialize,serde::Deserialize)]
pub struct ListenerId(u64);

#[derive(PartialEq,Eq,PartialOrd,Ord,Hash,Debug,Clone,Copy,serde::Serialize,serde::Deserialize)]
pub struct ConnectionId(u64);

impl ListenerId
{
    pub const fn new(id: u64) -> Self { Self(id) }
}

impl ConnectionId
{
    pub const fn new(id: u64) -> Self { Self(id) }
}

impl fmt::Display for ListenerId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "L{}", self.0)
    }
}

impl fmt::Display for ConnectionId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "C{}", self.0)
    }
}

/// Hands out sequential IDs. A reactor is driven from a single thread, so a
/// `Cell` is all the state this needs.
#[derive(Debug)]
pub struct IdGenerator<T>
{
    next: Cell<u64>,
    make: fn(u64) -> T,
}

impl<T> IdGenerator<T>
{
    fn with_constructor(start: u64, make: fn(u64) -> T) -> Self
    {
        Self { next: Cell::new(start), make }
    }

    pub fn next(&self) -> T
    {
        let id = self.next.get();
        self.next.set(id + 1);
        (self.make)(id)
    }
}

pub type ListenerIdGenerator = IdGenerator<ListenerId>;
pub type ConnectionIdGenerator = IdGenerator<ConnectionId>;

impl IdGenerator<ListenerId>
{
    pub fn new(start: u64) -> Self
    {
        Self::with_constructor(start, ListenerId::new)
    }
}

impl IdGenerator<ConnectionId>
{
    pub fn new(start: u64) -> Self
    {
        Self::with_constructor(start, ConnectionId::new)
    }
}
