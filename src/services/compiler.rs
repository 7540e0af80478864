use epub_builder::{EpubBuilder, EpubContent, ReferenceType, ZipLibrary};
use thiserror::Error;

use crate::models::BookMetadata;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to build epub: {0}")]
    Epub(String),
}

/// Assembles the whole book as plain text: front matter, structure, one
/// `## Capítulo i` section per chapter and the author section.
pub fn compile_book(metadata: &BookMetadata, structure: &str, chapters: &[String]) -> String {
    let request = &metadata.request;
    let mut book = format!(
        "# {title}\n\n\
         ## Livro\n\n\
         Por {author}\n\n\
         Copyright {year} {author}\n\
         Todos os direitos reservados.\n\n\
         ---\n\n\
         {structure}\n\n\
         ---\n\n",
        title = request.theme.to_uppercase(),
        author = request.author,
        year = metadata.year,
    );

    for (idx, chapter) in chapters.iter().enumerate() {
        book.push_str(&format!("\n\n## Capítulo {}\n\n{}\n\n---\n", idx + 1, chapter));
    }

    book.push_str(&format!(
        "\n## Sobre o Autor\n\n\
         {author} é um autor de livros apaixonado por criar histórias que inspiram e educam.\n\n\
         Para contato: {email}\n\n\
         Este livro foi gerado com assistência de Inteligência Artificial para publicação na Amazon KDP.\n",
        author = request.author,
        email = request.author_email,
    ));

    book
}

fn paragraphs_to_xhtml(text: &str) -> String {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", html_escape::encode_text(p).replace('\n', "<br/>")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn xhtml_page(title: &str, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <html xmlns=\"http://www.w3.org/1999/xhtml\">\n\
         <head><title>{title}</title></head>\n\
         <body>\n<h1>{title}</h1>\n{body}\n</body>\n</html>\n",
        title = html_escape::encode_text(title),
    )
}

/// Renders the book as an EPUB: a title page, the structure, one page per
/// chapter and the author section.
pub fn export_epub(
    metadata: &BookMetadata,
    structure: &str,
    chapters: &[String],
) -> Result<Vec<u8>, ExportError> {
    let request = &metadata.request;
    let epub_err = |e: &dyn std::fmt::Display| ExportError::Epub(e.to_string());

    let zip = ZipLibrary::new().map_err(|e| epub_err(&e))?;
    let mut builder = EpubBuilder::new(zip).map_err(|e| epub_err(&e))?;
    builder
        .metadata("author", request.author.as_str())
        .map_err(|e| epub_err(&e))?
        .metadata("title", request.theme.as_str())
        .map_err(|e| epub_err(&e))?
        .metadata("lang", "pt")
        .map_err(|e| epub_err(&e))?;

    let front = xhtml_page(
        &request.theme,
        &paragraphs_to_xhtml(&format!(
            "Por {}\n\nCopyright {} {}\nTodos os direitos reservados.",
            request.author, metadata.year, request.author
        )),
    );
    builder
        .add_content(
            EpubContent::new("title.xhtml", front.as_bytes())
                .title(request.theme.as_str())
                .reftype(ReferenceType::TitlePage),
        )
        .map_err(|e| epub_err(&e))?;

    let structure_page = xhtml_page("Estrutura", &paragraphs_to_xhtml(structure));
    builder
        .add_content(
            EpubContent::new("estrutura.xhtml", structure_page.as_bytes())
                .title("Estrutura")
                .reftype(ReferenceType::Preface),
        )
        .map_err(|e| epub_err(&e))?;

    for (idx, chapter) in chapters.iter().enumerate() {
        let title = format!("Capítulo {}", idx + 1);
        let page = xhtml_page(&title, &paragraphs_to_xhtml(chapter));
        builder
            .add_content(
                EpubContent::new(format!("capitulo_{}.xhtml", idx + 1), page.as_bytes())
                    .title(title)
                    .reftype(ReferenceType::Text),
            )
            .map_err(|e| epub_err(&e))?;
    }

    let about = xhtml_page(
        "Sobre o Autor",
        &paragraphs_to_xhtml(&format!(
            "{} é um autor de livros apaixonado por criar histórias que inspiram e educam.\n\nPara contato: {}",
            request.author, request.author_email
        )),
    );
    builder
        .add_content(EpubContent::new("sobre_o_autor.xhtml", about.as_bytes()).title("Sobre o Autor"))
        .map_err(|e| epub_err(&e))?;

    builder.inline_toc();

    let mut out = Vec::new();
    builder.generate(&mut out).map_err(|e| epub_err(&e))?;
    Ok(out)
}
