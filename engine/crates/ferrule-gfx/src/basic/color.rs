/// debug label 使用的颜色
pub struct LabelColor;
impl LabelColor {
    const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];
    const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];
    const YELLOW: [f32; 4] = [1.0, 1.0, 0.0, 1.0];
    const MAGENTA: [f32; 4] = [1.0, 0.0, 1.0, 1.0];

    pub const COLOR_PASS: [f32; 4] = Self::BLUE;
    pub const COLOR_STAGE: [f32; 4] = Self::YELLOW;
    pub const COLOR_CMD: [f32; 4] = Self::GREEN;
    pub const COLOR_BARRIER: [f32; 4] = Self::MAGENTA;
}
