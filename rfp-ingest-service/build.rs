fn main() {
    // PDFium is bound at runtime by the text detector, nothing to link here.
    // Lookup order: ./, vendor/pdfium/lib/, then the system library paths.
    println!("cargo:rerun-if-changed=build.rs");
}
