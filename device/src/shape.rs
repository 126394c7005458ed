//! Tensor shapes and the integer helpers used for slice packing.

/// Divide rounding towards positive infinity.
pub const fn divide_round_up(n: usize, divisor: usize) -> usize {
    n.div_ceil(divisor)
}

/// Round `n` up to the next multiple of `alignment`.
pub const fn align_by_n(n: usize, alignment: usize) -> usize {
    divide_round_up(n, alignment) * alignment
}

/// Logical tensor shape in (batch, height, width, depth, channel) order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Bhwdc {
    pub b: usize,
    pub h: usize,
    pub w: usize,
    pub d: usize,
    pub c: usize,
}

impl Bhwdc {
    pub const fn new(b: usize, h: usize, w: usize, d: usize, c: usize) -> Self {
        Self { b, h, w, d, c }
    }

    /// Number of 4-channel slices.
    pub const fn slices(&self) -> usize {
        divide_round_up(self.c, 4)
    }

    /// Total number of logical elements.
    pub const fn elements(&self) -> usize {
        self.b * self.h * self.w * self.d * self.c
    }

    /// Index of an element in the flat host layout (channels innermost).
    pub const fn linear_index(&self, b: usize, y: usize, x: usize, d: usize, c: usize) -> usize {
        (((b * self.h + y) * self.w + x) * self.d + d) * self.c + c
    }

    pub const fn has_zero_dim(&self) -> bool {
        self.b == 0 || self.h == 0 || self.w == 0 || self.d == 0 || self.c == 0
    }
}

impl From<Bhwc> for Bhwdc {
    fn from(shape: Bhwc) -> Self {
        Self::new(shape.b, shape.h, shape.w, 1, shape.c)
    }
}

impl std::fmt::Display for Bhwdc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}x{}x{}", self.b, self.h, self.w, self.d, self.c)
    }
}

/// Shape without a depth axis, as graph values carry it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Bhwc {
    pub b: usize,
    pub h: usize,
    pub w: usize,
    pub c: usize,
}

impl Bhwc {
    pub const fn new(b: usize, h: usize, w: usize, c: usize) -> Self {
        Self { b, h, w, c }
    }
}
