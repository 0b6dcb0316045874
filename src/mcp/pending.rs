//! 待响应请求表
//!
//! 每个出站请求登记一个 oneshot 发送端；读取任务按 id 投递响应。
//! 超时的 id 进入 expired 集合，之后迟到的同 id 响应被丢弃，不会投递给后续请求。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::core::ClientError;

/// 记住的已超时 id 数量上限
const EXPIRED_CAPACITY: usize = 64;

pub type Reply = Result<Value, ClientError>;

/// 一个在途请求
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub method: String,
    tx: oneshot::Sender<Reply>,
}

/// 投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// 已交给对应等待者
    Delivered,
    /// 属于已超时（或等待者已放弃）的请求，丢弃
    Stale,
    /// 从未登记过的 id
    Unmatched,
}

#[derive(Default)]
struct TableState {
    waiters: HashMap<u64, PendingRequest>,
    expired: HashSet<u64>,
    expired_order: VecDeque<u64>,
    closed: Option<String>,
}

impl TableState {
    fn remember_expired(&mut self, id: u64) {
        if self.expired.insert(id) {
            self.expired_order.push_back(id);
        }
        while self.expired_order.len() > EXPIRED_CAPACITY {
            if let Some(old) = self.expired_order.pop_front() {
                self.expired.remove(&old);
            }
        }
    }
}

/// 待响应请求表（客户端实例独占，每次 start() 新建）
#[derive(Default)]
pub struct PendingTable {
    state: Mutex<TableState>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 登记请求，返回接收端与截止时间；表已关闭（进程输出流结束）时直接失败
    pub fn register(
        &self,
        id: u64,
        method: &str,
        budget: Duration,
    ) -> Result<(oneshot::Receiver<Reply>, Instant), ClientError> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(ClientError::ProtocolReadFailure(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + budget;
        state.waiters.insert(
            id,
            PendingRequest {
                id,
                method: method.to_string(),
                tx,
            },
        );
        Ok((rx, deadline))
    }

    /// 按 id 投递响应
    pub fn deliver(&self, id: u64, reply: Reply) -> Delivery {
        let mut state = self.lock();
        if let Some(waiter) = state.waiters.remove(&id) {
            if waiter.tx.send(reply).is_ok() {
                return Delivery::Delivered;
            }
            // 接收端已因超时被丢弃
            state.remember_expired(id);
            return Delivery::Stale;
        }
        if state.expired.remove(&id) {
            state.expired_order.retain(|x| *x != id);
            return Delivery::Stale;
        }
        Delivery::Unmatched
    }

    /// 等待超时：移除等待者并记住该 id
    pub fn expire(&self, id: u64) {
        let mut state = self.lock();
        state.waiters.remove(&id);
        state.remember_expired(id);
    }

    /// 写入失败等情况下撤销登记
    pub fn remove(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    /// 以 ProtocolReadFailure 结束所有在途请求（畸形帧 / 未匹配 id），表仍可继续使用
    pub fn fail_in_flight(&self, reason: &str) -> usize {
        let mut state = self.lock();
        let waiters: Vec<PendingRequest> = state.waiters.drain().map(|(_, w)| w).collect();
        let count = waiters.len();
        for waiter in waiters {
            tracing::warn!(id = waiter.id, method = %waiter.method, reason, "failing in-flight request");
            let _ = waiter
                .tx
                .send(Err(ClientError::ProtocolReadFailure(reason.to_string())));
        }
        count
    }

    /// 输出流结束或客户端停止：结束所有在途请求，此后登记一律失败
    pub fn close(&self, reason: &str) {
        {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
        }
        self.fail_in_flight(reason);
    }
}
