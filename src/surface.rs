use crate::model::TermSize;

/// Text a rendering surface exposes for path inference.
pub trait ScrollbackSource {
    /// The most recent `max` lines, oldest first.
    fn recent_lines(&self, max: usize) -> Vec<String>;
}

impl ScrollbackSource for str {
    fn recent_lines(&self, max: usize) -> Vec<String> {
        let mut lines: Vec<String> = self.lines().rev().take(max).map(str::to_string).collect();
        lines.reverse();
        lines
    }
}

impl ScrollbackSource for String {
    fn recent_lines(&self, max: usize) -> Vec<String> {
        self.as_str().recent_lines(max)
    }
}

impl<S: AsRef<str>> ScrollbackSource for [S] {
    fn recent_lines(&self, max: usize) -> Vec<String> {
        let start = self.len().saturating_sub(max);
        self[start..].iter().map(|l| l.as_ref().to_string()).collect()
    }
}

impl<S: AsRef<str>> ScrollbackSource for Vec<S> {
    fn recent_lines(&self, max: usize) -> Vec<String> {
        self.as_slice().recent_lines(max)
    }
}

/// Minimal headless terminal surface backed by `vt100`.
pub struct VtSurface {
    parser: vt100::Parser,
}

impl VtSurface {
    pub fn new(size: TermSize, scrollback_len: usize) -> Self {
        Self {
            parser: vt100::Parser::new(size.rows.max(1), size.cols.max(1), scrollback_len),
        }
    }

    pub fn process(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    pub fn title(&self) -> &str {
        self.parser.screen().title()
    }

    /// Lines of history currently held above the visible screen.
    pub fn scrollback_max(&mut self) -> usize {
        let cur = self.parser.screen().scrollback();
        self.parser.set_scrollback(usize::MAX);
        let max = self.parser.screen().scrollback();
        self.parser.set_scrollback(cur);
        max
    }

    /// The most recent `max` lines of history plus screen, oldest first.
    ///
    /// History is read one row at a time by stepping the scrollback offset,
    /// then the user's offset is restored. Only one screen height of history is
    /// reachable: vt100 cannot show an offset larger than the screen.
    pub fn snapshot(&mut self, max: usize) -> Vec<String> {
        let (rows, cols) = self.parser.screen().size();
        let cur = self.parser.screen().scrollback();

        let history = self
            .scrollback_max()
            .min(usize::from(rows))
            .min(max.saturating_sub(usize::from(rows)));
        let mut lines = Vec::with_capacity(history + usize::from(rows));
        for offset in (1..=history).rev() {
            self.parser.set_scrollback(offset);
            if let Some(row) = self.parser.screen().rows(0, cols).next() {
                lines.push(row);
            }
        }
        self.parser.set_scrollback(0);
        lines.extend(self.parser.screen().rows(0, cols));
        self.parser.set_scrollback(cur);

        // Blank rows below the cursor are not history.
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }
        let start = lines.len().saturating_sub(max);
        lines.split_off(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_sources_return_tail_in_order() {
        let text = "a\nb\nc\nd";
        assert_eq!(text.recent_lines(2), vec!["c", "d"]);
        let lines = vec!["x".to_string(), "y".to_string()];
        assert_eq!(lines.recent_lines(10), vec!["x", "y"]);
        assert_eq!(["1", "2", "3"][..].recent_lines(1), vec!["3"]);
    }

    #[test]
    fn vt_surface_exposes_history_and_screen() {
        let mut surface = VtSurface::new(TermSize { cols: 40, rows: 3 }, 100);
        for i in 0..5 {
            surface.process(format!("line {i}\r\n").as_bytes());
        }
        surface.process(b"[root@box web]# ");
        let lines = surface.snapshot(50);
        assert_eq!(lines.last().map(|l| l.trim_end()), Some("[root@box web]#"));
        assert!(lines.iter().any(|l| l.trim_end() == "line 4"));
        assert!(lines.iter().any(|l| l.trim_end() == "line 2"));
    }

    #[test]
    fn vt_surface_reports_title() {
        let mut surface = VtSurface::new(TermSize::default(), 10);
        surface.process(b"\x1b]2;root@box: /srv\x07");
        assert_eq!(surface.title(), "root@box: /srv");
    }
}
