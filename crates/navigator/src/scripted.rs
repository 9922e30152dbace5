//! Deterministic [`CoursePage`] for exercising navigators without a browser.

use browser::{BrowserError, CoursePage, RequestListener};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// How the page reacts to the pagination key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyResponse {
    /// Moves to the next lesson and requests its manifest.
    Paginates,
    /// Nothing happens.
    Ignores,
    /// The heading text changes but neither the route nor the stream does.
    TitleOnly,
    /// The route changes; the manifest request only comes with the next step.
    RouteOnly,
    /// Ignores the key until the player has been nudged, then paginates.
    NeedsFocus,
}

pub struct ScriptedPage {
    lessons: Vec<String>,
    response: KeyResponse,
    script: Mutex<Option<VecDeque<Vec<String>>>>,
    position: Mutex<usize>,
    title_bumps: AtomicU32,
    listener: Mutex<Option<RequestListener>>,
    closed: AtomicBool,
    advances: AtomicU32,
    focused: AtomicBool,
    nudges: AtomicU32,
}

pub fn manifest_url(n: usize, token: &str) -> String {
    format!("https://stream.mux.com/lesson{}.m3u8?token={}", n, token)
}

impl ScriptedPage {
    /// A course of `lessons` videos that either follows the arrow key or ignores it.
    pub fn course(lessons: usize, paginates: bool) -> Self {
        let response = if paginates {
            KeyResponse::Paginates
        } else {
            KeyResponse::Ignores
        };
        Self::with_response(lessons, response)
    }

    pub fn with_response(lessons: usize, response: KeyResponse) -> Self {
        Self {
            lessons: (1..=lessons).map(|n| manifest_url(n, "t0")).collect(),
            response,
            script: Mutex::new(None),
            position: Mutex::new(0),
            title_bumps: AtomicU32::new(0),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
            advances: AtomicU32::new(0),
            focused: AtomicBool::new(false),
            nudges: AtomicU32::new(0),
        }
    }

    /// Same course, with every manifest carrying `token` instead of the default one.
    pub fn with_token(mut self, token: &str) -> Self {
        self.lessons = (1..=self.lessons.len()).map(|n| manifest_url(n, token)).collect();
        self
    }

    /// A page whose n-th key press emits exactly `steps[n]`. Presses past the script emit nothing.
    pub fn scripted(first: &str, steps: Vec<Vec<String>>) -> Self {
        let mut page = Self::with_response(0, KeyResponse::Paginates);
        page.lessons = vec![first.to_string()];
        page.script = Mutex::new(Some(steps.into_iter().collect()));
        page
    }

    /// Simulates the initial page load: the first lesson plays, plus unrelated traffic.
    pub fn load(&self) {
        self.emit("https://courses.example.com/static/app.js");
        if let Some(url) = self.lessons.first() {
            self.emit(url);
        }
    }

    /// A human clicking the next lesson in the sidebar.
    pub fn click_next(&self) {
        let next = {
            let mut position = self.position.lock().unwrap();
            if *position + 1 >= self.lessons.len() {
                return;
            }
            *position += 1;
            self.lessons[*position].clone()
        };
        self.emit(&next);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.listener.lock().unwrap().take();
    }

    pub fn advance_count(&self) -> u32 {
        self.advances.load(Ordering::SeqCst)
    }

    pub fn nudge_count(&self) -> u32 {
        self.nudges.load(Ordering::SeqCst)
    }

    fn emit(&self, url: &str) {
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener(url);
        }
    }
}

impl CoursePage for ScriptedPage {
    fn watch_requests(&self, listener: RequestListener) -> Result<(), BrowserError> {
        *self.listener.lock().unwrap() = Some(listener);
        Ok(())
    }

    fn advance(&self) -> Result<(), BrowserError> {
        if self.is_closed() {
            return Err(BrowserError::PageClosed);
        }
        self.advances.fetch_add(1, Ordering::SeqCst);

        let scripted = self
            .script
            .lock()
            .unwrap()
            .as_mut()
            .map(|steps| steps.pop_front().unwrap_or_default());
        if let Some(urls) = scripted {
            if !urls.is_empty() {
                *self.position.lock().unwrap() += 1;
            }
            for url in urls {
                self.emit(&url);
            }
            return Ok(());
        }

        match self.response {
            KeyResponse::Paginates => self.click_next(),
            KeyResponse::NeedsFocus => {
                if self.focused.load(Ordering::SeqCst) {
                    self.click_next();
                }
            }
            KeyResponse::Ignores => {}
            KeyResponse::TitleOnly => {
                self.title_bumps.fetch_add(1, Ordering::SeqCst);
            }
            KeyResponse::RouteOnly => {
                let mut position = self.position.lock().unwrap();
                if *position + 1 < self.lessons.len() {
                    *position += 1;
                }
            }
        }
        Ok(())
    }

    fn nudge(&self) -> Result<(), BrowserError> {
        if self.is_closed() {
            return Err(BrowserError::PageClosed);
        }
        self.nudges.fetch_add(1, Ordering::SeqCst);
        self.focused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn lesson_title(&self) -> Result<Option<String>, BrowserError> {
        if self.is_closed() {
            return Err(BrowserError::PageClosed);
        }
        let position = *self.position.lock().unwrap();
        let bumps = self.title_bumps.load(Ordering::SeqCst);
        Ok(Some(if bumps == 0 {
            format!("Module {}", position + 1)
        } else {
            format!("Module {} ({})", position + 1, bumps)
        }))
    }

    fn current_url(&self) -> Result<String, BrowserError> {
        if self.is_closed() {
            return Err(BrowserError::PageClosed);
        }
        let position = *self.position.lock().unwrap();
        Ok(format!("https://courses.example.com/lesson/{}", position + 1))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
