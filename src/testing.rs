//! Test doubles shared by the unit tests.
//!
//! Every mock is a cheap handle onto shared state: the code under test owns
//! one handle, the test keeps another to script and inspect it.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::string::String;
use std::vec::Vec;

use core::future::poll_fn;
use core::task::Poll;

use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{ErrorKind, ErrorType, I2c, Operation, SevenBitAddress};

use crate::clock::Clock;
use crate::device::{LinkAddress, LinkKey};
use crate::packet::{self, MqttPacket};
use crate::radio::{FrameInfo, RadioDriver};
use crate::transport::MqttTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockIoError;

impl embedded_hal_async::i2c::Error for MockIoError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

// --- Time ---

#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::from_ticks(0))),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn set(&self, at: Instant) {
        self.now.set(at);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// Returns immediately, moving the clock forward by the requested time and
/// recording each sleep in milliseconds.
#[derive(Debug, Clone)]
pub struct FakeDelay {
    clock: ManualClock,
    calls: Rc<RefCell<Vec<u32>>>,
}

impl FakeDelay {
    pub fn new(clock: &ManualClock) -> Self {
        Self {
            clock: clock.clone(),
            calls: Rc::default(),
        }
    }

    pub fn calls(&self) -> Vec<u32> {
        self.calls.borrow().clone()
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }

    /// Total time slept so far.
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.calls.borrow().iter().map(|ms| *ms as u64).sum())
    }
}

impl DelayNs for FakeDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.delay_us(ns.div_ceil(1000)).await
    }

    async fn delay_us(&mut self, us: u32) {
        self.clock.advance(Duration::from_micros(us as u64));
        self.calls.borrow_mut().push(us.div_ceil(1000));
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.clock.advance(Duration::from_millis(ms as u64));
        self.calls.borrow_mut().push(ms);
    }
}

// --- Broker ---

#[derive(Debug, Clone)]
pub struct ConnectRecord {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub will_topic: Option<String>,
    pub will_retain: bool,
}

#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Debug)]
struct BrokerState {
    open: bool,
    hung_up: bool,
    inbox: VecDeque<u8>,
    connects: Vec<ConnectRecord>,
    publishes: Vec<PublishRecord>,
    pings: usize,
    disconnects: usize,
    refuse_code: Option<u8>,
    answer_pings: bool,
    fail_opens: u32,
    fail_publishes: u32,
    fail_pings: u32,
}

impl BrokerState {
    fn readable(&self) -> bool {
        self.open && (self.hung_up || !self.inbox.is_empty())
    }

    fn handle(&mut self, bytes: &[u8]) -> Result<(), MockIoError> {
        match packet::decode(bytes).expect("client sent a malformed packet") {
            Some(MqttPacket::Connect(connect)) => {
                self.connects.push(ConnectRecord {
                    client_id: connect.client_id.into(),
                    keep_alive: connect.keep_alive,
                    clean_session: connect.clean_session,
                    username: connect.username.map(Into::into),
                    will_topic: connect.will.map(|w| w.topic.into()),
                    will_retain: connect.will.is_some_and(|w| w.retain),
                });
                let code = self.refuse_code.unwrap_or(0);
                self.inbox.extend([0x20, 0x02, 0x00, code]);
            }
            Some(MqttPacket::Publish(publish)) => {
                if self.fail_publishes > 0 {
                    self.fail_publishes -= 1;
                    self.open = false;
                    return Err(MockIoError);
                }
                self.publishes.push(PublishRecord {
                    topic: publish.topic.into(),
                    payload: String::from_utf8_lossy(publish.payload).into_owned(),
                    retain: publish.retain,
                });
            }
            Some(MqttPacket::PingReq) => {
                if self.fail_pings > 0 {
                    self.fail_pings -= 1;
                    self.open = false;
                    return Err(MockIoError);
                }
                self.pings += 1;
                if self.answer_pings {
                    self.inbox.extend([0xD0, 0x00]);
                }
            }
            Some(MqttPacket::Disconnect) => self.disconnects += 1,
            other => panic!("unexpected packet from client: {:?}", other),
        }
        Ok(())
    }
}

/// In-memory MQTT broker. Speaks real MQTT bytes to the client through
/// [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockBroker {
    state: Rc<RefCell<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(BrokerState {
                open: false,
                hung_up: false,
                inbox: VecDeque::new(),
                connects: Vec::new(),
                publishes: Vec::new(),
                pings: 0,
                disconnects: 0,
                refuse_code: None,
                answer_pings: true,
                fail_opens: 0,
                fail_publishes: 0,
                fail_pings: 0,
            })),
        }
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport {
            state: self.state.clone(),
        }
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.state.borrow().connects.clone()
    }

    pub fn publishes(&self) -> Vec<PublishRecord> {
        self.state.borrow().publishes.clone()
    }

    pub fn publishes_to(&self, topic: &str) -> Vec<PublishRecord> {
        self.state
            .borrow()
            .publishes
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear_publishes(&self) {
        self.state.borrow_mut().publishes.clear();
    }

    pub fn pings(&self) -> usize {
        self.state.borrow().pings
    }

    pub fn disconnects(&self) -> usize {
        self.state.borrow().disconnects
    }

    /// Answers every CONNECT with this CONNACK return code.
    pub fn refuse_with(&self, code: u8) {
        self.state.borrow_mut().refuse_code = Some(code);
    }

    pub fn answer_pings(&self, answer: bool) {
        self.state.borrow_mut().answer_pings = answer;
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.state.borrow_mut().fail_opens = n;
    }

    /// The next `n` PUBLISH sends fail and drop the connection.
    pub fn fail_next_publishes(&self, n: u32) {
        self.state.borrow_mut().fail_publishes = n;
    }

    pub fn fail_next_pings(&self, n: u32) {
        self.state.borrow_mut().fail_pings = n;
    }

    /// Queues raw bytes for the client to read.
    pub fn inject(&self, bytes: &[u8]) {
        self.state.borrow_mut().inbox.extend(bytes.iter().copied());
    }

    /// Closes the connection from the broker side.
    pub fn hang_up(&self) {
        self.state.borrow_mut().hung_up = true;
    }
}

#[derive(Debug)]
pub struct MockTransport {
    state: Rc<RefCell<BrokerState>>,
}

impl MqttTransport for MockTransport {
    type Error = MockIoError;

    async fn open(&mut self) -> Result<(), MockIoError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.inbox.clear();
        s.hung_up = false;
        if s.fail_opens > 0 {
            s.fail_opens -= 1;
            s.open = false;
            return Err(MockIoError);
        }
        s.open = true;
        Ok(())
    }

    fn close(&mut self) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.open = false;
        s.hung_up = false;
        s.inbox.clear();
    }

    async fn send(&mut self, buf: &[u8]) -> Result<(), MockIoError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if !s.open {
            return Err(MockIoError);
        }
        s.handle(buf)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, MockIoError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if s.hung_up {
            return Ok(0);
        }
        if !s.open {
            return Err(MockIoError);
        }
        let n = buf.len().min(s.inbox.len());
        for (slot, byte) in buf.iter_mut().zip(s.inbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn wait_readable(&mut self) {
        poll_fn(|_| {
            if self.state.borrow().readable() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }

    fn is_readable(&self) -> bool {
        self.state.borrow().readable()
    }
}

// --- Radio ---

#[derive(Debug, Default)]
struct RadioState {
    active: bool,
    primary_key: bool,
    broken: bool,
    fail_sends: u32,
    peers: Vec<(LinkAddress, bool)>,
    queue: VecDeque<(LinkAddress, Vec<u8>, Option<i16>)>,
    sent: Vec<(LinkAddress, Vec<u8>)>,
}

/// Scripted radio. Frames pushed by the test are received in order.
#[derive(Debug, Clone, Default)]
pub struct MockRadio {
    state: Rc<RefCell<RadioState>>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn driver(&self) -> MockRadioDriver {
        MockRadioDriver {
            state: self.state.clone(),
        }
    }

    pub fn push(&self, sender: LinkAddress, data: &[u8], rssi: Option<i16>) {
        self.state
            .borrow_mut()
            .queue
            .push_back((sender, data.to_vec(), rssi));
    }

    /// Registered peers and whether each has a link key.
    pub fn peers(&self) -> Vec<(LinkAddress, bool)> {
        self.state.borrow().peers.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state.borrow().active
    }

    pub fn has_primary_key(&self) -> bool {
        self.state.borrow().primary_key
    }

    /// Every receive from now on reports a hardware error.
    pub fn break_hardware(&self) {
        self.state.borrow_mut().broken = true;
    }

    pub fn fail_sends(&self, n: u32) {
        self.state.borrow_mut().fail_sends = n;
    }

    /// Frames that were acknowledged.
    pub fn sent(&self) -> Vec<(LinkAddress, Vec<u8>)> {
        self.state.borrow().sent.clone()
    }
}

#[derive(Debug)]
pub struct MockRadioDriver {
    state: Rc<RefCell<RadioState>>,
}

impl RadioDriver for MockRadioDriver {
    type Error = MockIoError;

    fn activate(&mut self) -> Result<(), MockIoError> {
        self.state.borrow_mut().active = true;
        Ok(())
    }

    fn deactivate(&mut self) {
        let mut s = self.state.borrow_mut();
        s.active = false;
        s.primary_key = false;
        s.peers.clear();
    }

    fn set_primary_key(&mut self, _key: &LinkKey) -> Result<(), MockIoError> {
        self.state.borrow_mut().primary_key = true;
        Ok(())
    }

    fn add_peer(&mut self, address: LinkAddress, key: Option<&LinkKey>) -> Result<(), MockIoError> {
        self.state.borrow_mut().peers.push((address, key.is_some()));
        Ok(())
    }

    async fn wait_readable(&mut self) -> Result<(), MockIoError> {
        poll_fn(|_| {
            let s = self.state.borrow();
            if s.broken {
                Poll::Ready(Err(MockIoError))
            } else if !s.queue.is_empty() {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        })
        .await
    }

    fn try_receive(&mut self, buf: &mut [u8]) -> Result<Option<FrameInfo>, MockIoError> {
        let mut s = self.state.borrow_mut();
        if s.broken {
            return Err(MockIoError);
        }
        let Some((sender, data, rssi)) = s.queue.pop_front() else {
            return Ok(None);
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Some(FrameInfo { sender, len, rssi }))
    }

    async fn send(&mut self, address: LinkAddress, data: &[u8]) -> Result<(), MockIoError> {
        let mut s = self.state.borrow_mut();
        if s.fail_sends > 0 {
            s.fail_sends -= 1;
            return Err(MockIoError);
        }
        s.sent.push((address, data.to_vec()));
        Ok(())
    }
}

// --- I2C ---

#[derive(Debug, Default)]
struct BusState {
    writes: Vec<(u8, Vec<u8>)>,
    responses: VecDeque<Vec<u8>>,
    broken: bool,
}

/// Scripted I2C bus: records every write and answers reads from a queue of
/// canned responses, in order.
#[derive(Debug, Clone, Default)]
pub struct MockI2c {
    state: Rc<RefCell<BusState>>,
}

impl MockI2c {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, bytes: &[u8]) {
        self.state.borrow_mut().responses.push_back(bytes.to_vec());
    }

    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.state.borrow().writes.clone()
    }

    pub fn pending_responses(&self) -> usize {
        self.state.borrow().responses.len()
    }

    pub fn break_bus(&self) {
        self.state.borrow_mut().broken = true;
    }
}

impl ErrorType for MockI2c {
    type Error = MockIoError;
}

impl I2c<SevenBitAddress> for MockI2c {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), MockIoError> {
        let mut s = self.state.borrow_mut();
        if s.broken {
            return Err(MockIoError);
        }
        for op in operations {
            match op {
                Operation::Write(bytes) => s.writes.push((address, bytes.to_vec())),
                Operation::Read(buf) => {
                    let response = s.responses.pop_front().expect("no scripted response");
                    assert_eq!(response.len(), buf.len(), "scripted response length");
                    buf.copy_from_slice(&response);
                }
            }
        }
        Ok(())
    }
}
