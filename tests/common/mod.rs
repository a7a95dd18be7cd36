//! Shared test backends: a scripted factory that records traffic and can be told
//! to fail specific HTTP updates.

#![allow(dead_code)]

use labwire::backend::{Backend, BackendFactory, HttpBody, HttpMethod, HttpRequest};
use labwire::descriptor::Descriptor;
use labwire::{AppResult, LabError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One HTTP request seen by a scripted backend.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub descriptor: String,
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

#[derive(Default)]
struct Script {
    /// Command substring -> reply line
    replies: Vec<(String, String)>,
    /// HTTP path -> response body
    bodies: HashMap<String, Vec<u8>>,
    /// PUTs whose body has this `module_index` fail
    failing_modules: Vec<u64>,
    writes: Vec<(String, String)>,
    requests: Vec<SeenRequest>,
}

/// Factory whose backends follow a shared script.
#[derive(Default)]
pub struct ScriptedFactory {
    created: AtomicUsize,
    construction_delay: Mutex<Duration>,
    script: Arc<Mutex<Script>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Backends take this long to construct.
    pub fn slow(delay: Duration) -> Arc<Self> {
        let factory = Self::default();
        *factory.construction_delay.lock() = delay;
        Arc::new(factory)
    }

    /// Reply `reply` to any write containing `command`.
    pub fn reply(&self, command: &str, reply: &str) {
        self.script
            .lock()
            .replies
            .push((command.to_string(), reply.to_string()));
    }

    /// Serve `body` for requests on `path`.
    pub fn body(&self, path: &str, body: serde_json::Value) {
        self.script
            .lock()
            .bodies
            .insert(path.to_string(), body.to_string().into_bytes());
    }

    /// Fail every PUT addressed to `module_index`.
    pub fn fail_module(&self, module_index: u64) {
        self.script.lock().failing_modules.push(module_index);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// `(descriptor, text)` for every write so far.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.script.lock().writes.clone()
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.script.lock().requests.clone()
    }
}

impl BackendFactory for ScriptedFactory {
    fn create(&self, descriptor: &Descriptor) -> AppResult<Box<dyn Backend>> {
        let delay = *self.construction_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedBackend {
            descriptor: descriptor.to_string(),
            script: self.script.clone(),
            buffer: Vec::new(),
            open: false,
        }))
    }
}

struct ScriptedBackend {
    descriptor: String,
    script: Arc<Mutex<Script>>,
    buffer: Vec<u8>,
    open: bool,
}

impl Backend for ScriptedBackend {
    fn descriptor(&self) -> &str {
        &self.descriptor
    }

    fn open(&mut self) -> AppResult<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn write(&mut self, data: &[u8]) -> AppResult<usize> {
        let text = String::from_utf8_lossy(data).into_owned();
        let mut script = self.script.lock();
        if let Some((_, reply)) = script.replies.iter().find(|(cmd, _)| text.contains(cmd.as_str())) {
            self.buffer.extend_from_slice(reply.as_bytes());
            self.buffer.push(b'\n');
        }
        script.writes.push((self.descriptor.clone(), text));
        Ok(data.len())
    }

    fn read(&mut self, _size: Option<usize>) -> AppResult<Vec<u8>> {
        Ok(std::mem::take(&mut self.buffer))
    }

    fn readline(&mut self) -> AppResult<Vec<u8>> {
        match self.buffer.iter().position(|b| *b == b'\n') {
            Some(idx) => Ok(self.buffer.drain(..=idx).collect()),
            None => Ok(std::mem::take(&mut self.buffer)),
        }
    }

    fn request(&mut self, req: &HttpRequest) -> AppResult<Vec<u8>> {
        let body = match &req.body {
            Some(HttpBody::Json(value)) => Some(value.clone()),
            Some(HttpBody::Bytes(bytes)) => serde_json::from_slice(bytes).ok(),
            None => None,
        };
        let mut script = self.script.lock();
        script.requests.push(SeenRequest {
            descriptor: self.descriptor.clone(),
            method: req.method,
            path: req.path.clone(),
            body: body.clone(),
        });
        if req.method == HttpMethod::Put {
            let module = body
                .as_ref()
                .and_then(|b| b.get("module_index"))
                .and_then(serde_json::Value::as_u64);
            if module.is_some_and(|m| script.failing_modules.contains(&m)) {
                return Err(LabError::InvalidResponse(format!(
                    "500 Internal Server Error for {}",
                    req.path
                )));
            }
        }
        Ok(script.bodies.get(&req.path).cloned().unwrap_or_default())
    }
}
