use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::Error;

pub trait Message: 'static + Send {}

impl<T: 'static + Send> Message for T {}

/// Owns a resource and handles requests against it one at a time.
#[async_trait]
pub trait IoHandler: Send {
    type Request: Message;
    type Response: Message;

    async fn handle(&mut self, req: Self::Request) -> crate::Result<Self::Response>;

    /// Called once after the last request, before the handler is dropped.
    async fn shutdown(&mut self) {}
}

enum RequestMsg<T: IoHandler> {
    Task {
        req: T::Request,
        answer: oneshot::Sender<crate::Result<T::Response>>,
    },
    Drop,
}

pub struct IoTask<T: IoHandler> {
    tx: mpsc::UnboundedSender<RequestMsg<T>>,
}

impl<T: IoHandler> Clone for IoTask<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T: 'static + IoHandler> IoTask<T> {
    pub fn new(mut handler: T) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestMsg<T>>();
        task::spawn(async move {
            while let Some(x) = rx.recv().await {
                match x {
                    RequestMsg::Task { req, answer } => {
                        let result = handler.handle(req).await;
                        let _ = answer.send(result);
                    }
                    RequestMsg::Drop => break,
                }
            }
            handler.shutdown().await;
        });
        IoTask { tx }
    }

    /// Stops the task once the requests already queued are handled.
    pub fn disconnect(&self) {
        let _ = self.tx.send(RequestMsg::Drop);
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    pub async fn request(&self, req: T::Request) -> crate::Result<T::Response> {
        let (tx, rx) = oneshot::channel();
        let msg = RequestMsg::Task { req, answer: tx };
        self.tx.send(msg).map_err(|_| Error::closed())?;
        rx.await.map_err(|_| Error::closed())?
    }
}
