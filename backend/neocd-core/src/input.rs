//! Controller state and the selector multiplexer at $380000

use bincode::{Decode, Encode};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoypadState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub a: bool,
    pub b: bool,
    pub c: bool,
    pub d: bool,
}

impl JoypadState {
    // Button lines are active low
    fn to_byte(self) -> u8 {
        !(u8::from(self.up)
            | (u8::from(self.down) << 1)
            | (u8::from(self.left) << 2)
            | (u8::from(self.right) << 3)
            | (u8::from(self.a) << 4)
            | (u8::from(self.b) << 5)
            | (u8::from(self.c) << 6)
            | (u8::from(self.d) << 7))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeoGeoCdInputs {
    pub p1: JoypadState,
    pub p2: JoypadState,
    pub p1_start: bool,
    pub p1_select: bool,
    pub p2_start: bool,
    pub p2_select: bool,
}

/// Only these selector values route the controller lines through to the three input
/// registers; anything else reads back as all-ones.
const VALID_SELECTORS: [u8; 3] = [0x00, 0x12, 0x1B];

#[derive(Debug, Clone, Encode, Decode)]
pub struct InputState {
    input1: u8,
    input2: u8,
    input3: u8,
    selector: u8,
}

impl InputState {
    #[must_use]
    pub fn new() -> Self {
        Self { input1: 0xFF, input2: 0xFF, input3: 0x0F, selector: 0 }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn set_inputs(&mut self, inputs: &NeoGeoCdInputs) {
        self.input1 = inputs.p1.to_byte();
        self.input2 = inputs.p2.to_byte();
        self.input3 = !(u8::from(inputs.p1_start)
            | (u8::from(inputs.p1_select) << 1)
            | (u8::from(inputs.p2_start) << 2)
            | (u8::from(inputs.p2_select) << 3))
            & 0x0F;
    }

    pub fn set_selector(&mut self, selector: u8) {
        self.selector = selector;
    }

    fn selector_open(&self) -> bool {
        VALID_SELECTORS.contains(&self.selector)
    }

    #[must_use]
    pub fn input1(&self) -> Option<u8> {
        self.selector_open().then_some(self.input1)
    }

    #[must_use]
    pub fn input2(&self) -> Option<u8> {
        self.selector_open().then_some(self.input2)
    }

    #[must_use]
    pub fn input3(&self) -> Option<u8> {
        self.selector_open().then_some(self.input3)
    }
}

impl Default for InputState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_gates_inputs() {
        let mut input = InputState::new();
        input.set_inputs(&NeoGeoCdInputs {
            p1: JoypadState { up: true, ..JoypadState::default() },
            ..NeoGeoCdInputs::default()
        });

        assert_eq!(input.input1(), Some(0xFE));

        input.set_selector(0x09);
        assert_eq!(input.input1(), None);

        input.set_selector(0x12);
        assert_eq!(input.input1(), Some(0xFE));
        input.set_selector(0x1B);
        assert_eq!(input.input1(), Some(0xFE));
    }

    #[test]
    fn input3_holds_start_select_lines() {
        let mut input = InputState::new();
        input.set_inputs(&NeoGeoCdInputs {
            p1_start: true,
            p2_select: true,
            ..NeoGeoCdInputs::default()
        });

        assert_eq!(input.input3(), Some(0x06));
    }
}
