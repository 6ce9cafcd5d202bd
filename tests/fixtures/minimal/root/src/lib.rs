pub fn double(x: u32) -> u32 {
    leaf::add(x, x)
}
