//! Extraction of typed records from rendered portal pages.
//!
//! Every function here degrades to an empty or default result on unexpected
//! markup; nothing in this module returns an error.

use chrono::Local;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use url::Url;

use super::types::{Announcement, Category, Course, Item};

const TABLE_SELECTORS: [&str; 6] = [
    ".dosyaSistemi table.data",
    "table.data",
    ".dosyaSistemi table",
    "table[class*=\"data\"]",
    ".fileList table",
    "table.fileTable",
];

const LOGOUT_SELECTORS: [&str; 4] = [
    "#ctl00_Header1_tdLogout",
    "a[href*=\"Logout\"]",
    "a.oturumAc",
    "td[id*=\"tdLogout\"]",
];

pub const USERNAME_FIELD: &str = "ctl00$ContentPlaceHolder1$tbUserName";
pub const PASSWORD_FIELD: &str = "ctl00$ContentPlaceHolder1$tbPassword";

const COURSE_NAME_MARKER: &str = "var body = '<span style=\"font-weight:bold;\">";

/// Where a listing page sits: which course and category it belongs to and
/// the path of the folder it renders.
#[derive(Debug, Clone)]
pub struct ListingContext<'a> {
    pub page_url: &'a str,
    pub course_id: &'a str,
    pub category: Category,
    pub parent_path: &'a str,
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: ElementRef<'_>) -> String {
    normalize_text(&el.text().collect::<Vec<_>>().join(" "))
}

fn resolve_href(page_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    match Url::parse(page_url).and_then(|base| base.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}

/// True when the page shows any of the known logout controls.
pub fn has_logout_affordance(html: &str) -> bool {
    let doc = Html::parse_document(html);
    LOGOUT_SELECTORS
        .iter()
        .filter_map(|s| selector(s))
        .any(|sel| doc.select(&sel).next().is_some())
}

/// True when the page renders the username field of the login form.
pub fn is_login_page(html: &str) -> bool {
    let doc = Html::parse_document(html);
    selector(&format!("input[name=\"{USERNAME_FIELD}\"]"))
        .map(|sel| doc.select(&sel).next().is_some())
        .unwrap_or(false)
}

/// Authoritative course id from a page URL: the first `/Sinif/<id>` or
/// `/Ders/<id>` pair, matched case-insensitively.
pub fn derive_course_id(url: &str, fallback: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    };
    let segments = path.split('/').collect::<Vec<_>>();
    for pair in segments.windows(2) {
        let kind = pair[0].to_ascii_lowercase();
        if pair[1].is_empty() {
            continue;
        }
        if kind == "sinif" {
            return format!("/Sinif/{}", pair[1]);
        }
        if kind == "ders" {
            return format!("/Ders/{}", pair[1]);
        }
    }
    fallback.to_string()
}

/// Parses "12,5 MB" style sizes into bytes (base 1024). Unparseable input is 0.
pub fn parse_size(text: &str) -> u64 {
    let Some(start) = text.find(|c: char| c.is_ascii_digit()) else {
        return 0;
    };
    let rest = &text[start..];
    let number_len = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(rest.len());
    let number = rest[..number_len].replacen(',', ".", 1);
    let unit = rest[number_len..].trim_start().to_ascii_uppercase();

    let multiplier: f64 = if unit.starts_with("GB") {
        1024.0 * 1024.0 * 1024.0
    } else if unit.starts_with("MB") {
        1024.0 * 1024.0
    } else if unit.starts_with("KB") {
        1024.0
    } else if unit.starts_with('B') {
        1.0
    } else {
        return 0;
    };

    // Keep the leading well-formed decimal, e.g. "1.234.5" reads as 1.234.
    let mut seen_dot = false;
    let numeric = number
        .chars()
        .take_while(|c| {
            if *c == '.' {
                if seen_dot {
                    return false;
                }
                seen_dot = true;
            }
            true
        })
        .collect::<String>();
    match numeric.trim_end_matches('.').parse::<f64>() {
        Ok(value) => (value * multiplier).round() as u64,
        Err(_) => 0,
    }
}

/// Stable item id derived from where the item lives, not when it was seen.
pub fn item_id(course_id: &str, category: Category, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(course_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(category.label().as_bytes());
    hasher.update([0u8]);
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

fn find_listing_table(doc: &Html) -> Option<ElementRef<'_>> {
    for candidate in TABLE_SELECTORS {
        let Some(sel) = selector(candidate) else {
            continue;
        };
        if let Some(table) = doc.select(&sel).next() {
            return Some(table);
        }
    }
    let any_table = selector("table")?;
    doc.select(&any_table).next()
}

fn is_folder_row(url: &str, icon: Option<ElementRef<'_>>, size_text: &str) -> bool {
    if url.contains("Klasor") || url.contains("Folder") {
        return true;
    }
    if let Some(img) = icon {
        let attrs = ["src", "alt", "title"]
            .iter()
            .filter_map(|a| img.value().attr(a))
            .map(|v| v.to_lowercase())
            .collect::<Vec<_>>();
        if attrs
            .iter()
            .any(|v| v.contains("folder") || v.contains("klasor") || v.contains("klasör"))
        {
            return true;
        }
    }
    let size_lc = size_text.to_lowercase();
    size_text.is_empty() || size_text == "-" || size_lc.contains("klasör") || size_lc.contains("folder")
}

/// Items of one listing page. The header row and rows without a link are skipped.
pub fn parse_items(html: &str, ctx: &ListingContext<'_>) -> Vec<Item> {
    let doc = Html::parse_document(html);
    let Some(table) = find_listing_table(&doc) else {
        return Vec::new();
    };
    let (Some(row_sel), Some(cell_sel), Some(link_sel), Some(img_sel)) =
        (selector("tr"), selector("td"), selector("a"), selector("img"))
    else {
        return Vec::new();
    };

    let crawl_date = Local::now().format("%Y-%m-%d").to_string();
    let mut items = Vec::new();
    for row in table.select(&row_sel).skip(1) {
        let cells = row.select(&cell_sel).collect::<Vec<_>>();
        if cells.len() < 2 {
            continue;
        }
        let Some(link) = cells[0].select(&link_sel).next() else {
            continue;
        };
        let name = element_text(link);
        if name.is_empty() {
            continue;
        }
        let href = link.value().attr("href").unwrap_or_default();
        let icon = cells[0].select(&img_sel).next();
        let size_text = element_text(cells[1]);

        let is_folder = is_folder_row(href, icon, &size_text);
        let path = if ctx.parent_path.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", ctx.parent_path, name)
        };
        let upload_date = cells
            .get(2)
            .map(|c| element_text(*c))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| crawl_date.clone());

        items.push(Item {
            id: item_id(ctx.course_id, ctx.category, &path),
            course_id: ctx.course_id.to_string(),
            category: ctx.category,
            name,
            url: resolve_href(ctx.page_url, href),
            size_bytes: if is_folder { 0 } else { parse_size(&size_text) },
            upload_date,
            is_folder,
            path,
        });
    }
    items
}

fn course_name_from_script(script: &str) -> Option<String> {
    let start = script.find(COURSE_NAME_MARKER)? + COURSE_NAME_MARKER.len();
    let rest = &script[start..];
    let end = rest.find("</span>")?;
    let name = rest[..end].trim();
    if name.is_empty() || name.contains('<') {
        None
    } else {
        Some(name.to_string())
    }
}

/// Enrolled courses from the campus menu.
pub fn parse_courses(html: &str) -> Vec<Course> {
    let doc = Html::parse_document(html);
    let (Some(entry_sel), Some(code_sel), Some(script_sel), Some(link_sel), Some(term_sel)) = (
        selector(".menuErisimAgaci > ul > li"),
        selector("span[id^=\"eae\"] strong"),
        selector("script"),
        selector("ul li a"),
        selector("ul li span[id^=\"eas\"]"),
    ) else {
        return Vec::new();
    };

    let mut courses = Vec::new();
    for entry in doc.select(&entry_sel) {
        let code = entry.select(&code_sel).next().map(element_text).unwrap_or_default();
        let href = entry
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .unwrap_or_default()
            .trim()
            .to_string();
        if code.is_empty() || href.is_empty() {
            continue;
        }
        let name = entry
            .select(&script_sel)
            .filter_map(|s| course_name_from_script(&s.text().collect::<String>()))
            .last()
            .unwrap_or_else(|| code.clone());
        let term = entry.select(&term_sel).next().map(element_text).unwrap_or_default();
        courses.push(Course {
            id: href,
            code,
            name,
            term,
        });
    }
    courses
}

fn announcement_number(url: &str) -> Option<String> {
    let idx = url.find("/Duyuru/")?;
    let digits = url[idx + "/Duyuru/".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() { None } else { Some(digits) }
}

fn has_class(el: ElementRef<'_>, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

/// Author from a `div.tarih` that is a direct child of the announcement block.
fn announcement_author(block: ElementRef<'_>) -> String {
    let Some(author_sel) = selector("span.tarih, span#ctl00_ContentPlaceHolder1_lbKullanici") else {
        return String::new();
    };
    block
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|child| child.value().name() == "div" && has_class(*child, "tarih"))
        .find_map(|div| div.select(&author_sel).next().map(element_text))
        .unwrap_or_default()
}

/// Announcement stubs of a list page. `course_id` of `None` means the campus
/// feed, where each entry names its own course.
pub fn parse_announcement_list(
    html: &str,
    page_url: &str,
    course_id: Option<&str>,
) -> Vec<Announcement> {
    let doc = Html::parse_document(html);
    let (Some(block_sel), Some(title_sel), Some(body_sel), Some(date_sel), Some(strong_sel)) = (
        selector(".duyuruGoruntule"),
        selector("h2 a"),
        selector(".icerik"),
        selector("span.tarih"),
        selector("strong"),
    ) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (index, block) in doc.select(&block_sel).enumerate() {
        let Some(title_link) = block.select(&title_sel).next() else {
            continue;
        };
        let body = block.select(&body_sel).next();
        if course_id.is_none() && body.is_none() {
            continue;
        }
        let href = title_link.value().attr("href").unwrap_or_default();
        let url = resolve_href(page_url, href);
        let date = body
            .and_then(|b| b.select(&date_sel).last())
            .map(element_text)
            .unwrap_or_default();
        let number = announcement_number(href).unwrap_or_else(|| index.to_string());

        let (id, owner, course_name) = match course_id {
            Some(cid) => (
                format!("{cid}-announcement-{number}"),
                cid.to_string(),
                String::new(),
            ),
            None => (
                format!("kampus-announcement-{number}"),
                derive_course_id(&url, ""),
                body.and_then(|b| b.select(&strong_sel).next())
                    .map(element_text)
                    .unwrap_or_default(),
            ),
        };

        out.push(Announcement {
            id,
            course_id: owner,
            course_name,
            title: element_text(title_link),
            content: String::new(),
            date,
            author: announcement_author(block),
            url,
        });
    }
    out
}

fn collect_text_skipping_boilerplate(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child_el) = ElementRef::wrap(child) {
            if child_el.value().name() == "h2" || has_class(child_el, "tarih") {
                continue;
            }
            collect_text_skipping_boilerplate(child_el, out);
        }
    }
}

fn tidy_body(raw: &str) -> String {
    raw.lines()
        .map(normalize_text)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Full body text of an announcement detail page, without title and date lines.
pub fn parse_announcement_body(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    if let Some(sel) = selector(".duyuruGoruntule .icerik") {
        if let Some(body) = doc.select(&sel).next() {
            let text = tidy_body(&body.text().collect::<String>());
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    let block = doc.select(&selector(".duyuruGoruntule")?).next()?;
    let mut raw = String::new();
    collect_text_skipping_boilerplate(block, &mut raw);
    let text = tidy_body(&raw);
    if text.is_empty() { None } else { Some(text) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(parent: &'a str) -> ListingContext<'a> {
        ListingContext {
            page_url: "https://portal.test/Sinif/100.200/SinifDosyalari",
            course_id: "/Sinif/100.200",
            category: Category::ClassFiles,
            parent_path: parent,
        }
    }

    const LISTING: &str = r#"
        <html><body><div class="dosyaSistemi"><table class="data">
          <tr><th>Ad</th><th>Boyut</th><th>Tarih</th></tr>
          <tr><td><img src="/images/ds/klasor.png"/><a href="/Sinif/100.200/SinifDosyalari?g8223371">Week 1</a></td><td></td><td>01.10.2024</td></tr>
          <tr><td><img src="/images/ds/pdf.png"/><a href="/Sinif/100.200/DersDosyalari/Dosya?d12">notes.pdf</a></td><td>1,5 MB</td><td>02.10.2024</td></tr>
          <tr><td><a href="/Sinif/100.200/Klasor/7">Archive</a></td><td>3 KB</td></tr>
          <tr><td>no link here</td><td>1 KB</td></tr>
          <tr><td colspan="3">footer</td></tr>
        </table></div></body></html>
    "#;

    #[test]
    fn sizes_use_base_1024_and_comma_decimals() {
        assert_eq!(parse_size("1,5 MB"), 1_572_864);
        assert_eq!(parse_size("0 B"), 0);
        assert_eq!(parse_size("3 KB"), 3072);
        assert_eq!(parse_size("2 gb"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("-"), 0);
        assert_eq!(parse_size("about a megabyte"), 0);
        assert_eq!(parse_size("12"), 0);
    }

    #[test]
    fn listing_rows_become_items_with_composed_paths() {
        let items = parse_items(LISTING, &ctx("Lectures"));
        assert_eq!(items.len(), 3);

        assert_eq!(items[0].name, "Week 1");
        assert!(items[0].is_folder);
        assert_eq!(items[0].path, "Lectures/Week 1");
        assert_eq!(items[0].size_bytes, 0);
        assert_eq!(items[0].upload_date, "01.10.2024");

        assert_eq!(items[1].name, "notes.pdf");
        assert!(!items[1].is_folder);
        assert_eq!(items[1].size_bytes, 1_572_864);
        assert_eq!(
            items[1].url,
            "https://portal.test/Sinif/100.200/DersDosyalari/Dosya?d12"
        );
        assert_eq!(items[1].path, "Lectures/notes.pdf");
    }

    #[test]
    fn folder_url_wins_over_concrete_size() {
        let items = parse_items(LISTING, &ctx(""));
        let archive = items.iter().find(|i| i.name == "Archive").unwrap();
        assert!(archive.is_folder);
        assert_eq!(archive.path, "Archive");
    }

    #[test]
    fn plain_file_with_size_is_not_a_folder() {
        let html = r#"<table class="data"><tr><th>h</th></tr>
            <tr><td><a href="/Sinif/1.2/Dosya?f=9">hw.zip</a></td><td>3 KB</td></tr></table>"#;
        let items = parse_items(html, &ctx(""));
        assert_eq!(items.len(), 1);
        assert!(!items[0].is_folder);
        assert_eq!(items[0].size_bytes, 3072);
    }

    #[test]
    fn icon_alt_text_marks_folders() {
        let html = r#"<table><tr><th>h</th></tr>
            <tr><td><img src="/i/x.png" alt="Klasör"/><a href="/x?y=1">Misc</a></td><td>10 KB</td></tr></table>"#;
        let items = parse_items(html, &ctx(""));
        assert!(items[0].is_folder);
    }

    #[test]
    fn pages_without_tables_yield_nothing() {
        assert!(parse_items("<html><body><p>empty</p></body></html>", &ctx("")).is_empty());
    }

    #[test]
    fn item_ids_are_stable_and_path_specific() {
        let a = item_id("/Sinif/1.2", Category::ClassFiles, "A/b.pdf");
        assert_eq!(a, item_id("/Sinif/1.2", Category::ClassFiles, "A/b.pdf"));
        assert_ne!(a, item_id("/Sinif/1.2", Category::CourseFiles, "A/b.pdf"));
        assert_ne!(a, item_id("/Sinif/1.2", Category::ClassFiles, "A/c.pdf"));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn course_id_comes_from_the_url() {
        assert_eq!(
            derive_course_id("https://portal.test/sinif/123.456/SinifDosyalari?g1", "x"),
            "/Sinif/123.456"
        );
        assert_eq!(
            derive_course_id("https://portal.test/Ders/77/DersDosyalari", "x"),
            "/Ders/77"
        );
        assert_eq!(derive_course_id("https://portal.test/Kampus1", "/Sinif/fallback"), "/Sinif/fallback");
    }

    #[test]
    fn logout_affordance_and_login_form_are_detected() {
        assert!(has_logout_affordance(
            r#"<table><tr><td id="ctl00_Header1_tdLogout"><a>Çıkış</a></td></tr></table>"#
        ));
        assert!(has_logout_affordance(r#"<a href="/Logout.aspx">out</a>"#));
        assert!(!has_logout_affordance("<html><body>welcome</body></html>"));

        let login = format!(r#"<form><input name="{USERNAME_FIELD}"/><input type="submit"/></form>"#);
        assert!(is_login_page(&login));
        assert!(!is_login_page("<html></html>"));
    }

    #[test]
    fn courses_are_read_from_the_campus_menu() {
        let html = r#"
        <div class="menuErisimAgaci"><ul>
          <li><span id="eae1"><strong>BLG 101E</strong></span>
            <script>var body = '<span style="font-weight:bold;">Intro to Computing</span>';</script>
            <ul><li><a href="/Sinif/33350.110886">CRN</a><span id="eas1">33350</span></li></ul>
          </li>
          <li><span id="eae2"><strong>MAT 103</strong></span>
            <ul><li><a href="/Sinif/11111.2">CRN</a></li></ul>
          </li>
          <li><span id="eae3"><strong>NOLINK</strong></span></li>
        </ul></div>"#;
        let courses = parse_courses(html);
        assert_eq!(courses.len(), 2);
        assert_eq!(courses[0].id, "/Sinif/33350.110886");
        assert_eq!(courses[0].code, "BLG 101E");
        assert_eq!(courses[0].name, "Intro to Computing");
        assert_eq!(courses[0].term, "33350");
        assert_eq!(courses[1].name, "MAT 103");
    }

    #[test]
    fn course_announcement_stubs_carry_ids_dates_and_authors() {
        let html = r#"
        <div class="duyuruGoruntule">
          <h2><a href="/Sinif/1.2/Duyuru/4455">Midterm</a></h2>
          <div class="icerik">Room changed <span class="tarih">x</span><span class="tarih">10 Ekim 2024</span></div>
          <div class="tarih"><span class="tarih">Dr. Someone</span></div>
        </div>
        <div class="duyuruGoruntule"><h2><a href="/Sinif/1.2/Duyurular">No number</a></h2></div>"#;
        let list = parse_announcement_list(html, "https://portal.test/Sinif/1.2/Duyurular", Some("/Sinif/1.2"));
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "/Sinif/1.2-announcement-4455");
        assert_eq!(list[0].date, "10 Ekim 2024");
        assert_eq!(list[0].author, "Dr. Someone");
        assert_eq!(list[0].url, "https://portal.test/Sinif/1.2/Duyuru/4455");
        assert_eq!(list[1].id, "/Sinif/1.2-announcement-1");
    }

    #[test]
    fn campus_feed_entries_name_their_course() {
        let html = r#"
        <div class="duyuruGoruntule">
          <h2><a href="/Sinif/9.8/Duyuru/12">Quiz</a></h2>
          <div class="icerik"><strong>BLG 101E</strong> <span class="tarih">1 Ekim</span></div>
        </div>
        <div class="duyuruGoruntule"><h2><a href="/x">skipped, no body</a></h2></div>"#;
        let list = parse_announcement_list(html, "https://portal.test/Kampus?1/Duyurular", None);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "kampus-announcement-12");
        assert_eq!(list[0].course_id, "/Sinif/9.8");
        assert_eq!(list[0].course_name, "BLG 101E");
    }

    #[test]
    fn announcement_body_prefers_content_block() {
        let html = r#"<div class="duyuruGoruntule"><h2>T</h2>
            <div class="icerik">Line one
              Line two</div></div>"#;
        assert_eq!(parse_announcement_body(html).as_deref(), Some("Line one\nLine two"));

        let bare = r#"<div class="duyuruGoruntule"><h2>Title</h2><p>Body text</p><div class="tarih">today</div></div>"#;
        assert_eq!(parse_announcement_body(bare).as_deref(), Some("Body text"));
        assert_eq!(parse_announcement_body("<p>nothing</p>"), None);
    }
}
