use vt100::Parser;

use super::DEFAULT_SCROLLBACK_LINES;

/// VT100 rendering of a session's output, used to give the assistant a
/// plain-text view of what the user is looking at.
pub struct ScreenBuffer {
    parser: Parser,
    rows: u16,
    cols: u16,
}

impl ScreenBuffer {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            parser: Parser::new(rows, cols, DEFAULT_SCROLLBACK_LINES),
            rows,
            cols,
        }
    }

    /// Feed raw PTY output to the emulator
    pub fn process_output(&mut self, data: &[u8]) {
        self.parser.process(data);
    }

    /// Visible screen as plain text, trailing blank lines removed
    pub fn contents(&self) -> String {
        let contents = self.parser.screen().contents();
        contents.trim_end().to_string()
    }

    /// Cursor position (row, col)
    pub fn cursor_position(&self) -> (u16, u16) {
        self.parser.screen().cursor_position()
    }

    /// Size as (rows, cols)
    pub fn size(&self) -> (u16, u16) {
        (self.rows, self.cols)
    }

    /// Resize in place; the emulator reflows what it can and keeps the rest
    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.rows = rows;
        self.cols = cols;
        self.parser.set_size(rows, cols);
    }
}
