fn main() {
    zipdrop::run();
}
